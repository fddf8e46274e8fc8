//! Error types for the Wisp VM crate.
//!
//! Runtime errors that user code can observe travel on the running fiber as
//! heap strings (see [`crate::fiber`]); the types here carry errors across
//! the embedding boundary and out of the run entry points.

use thiserror::Error;

/// VM errors surfaced to the embedder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Compilation failed
    #[error("Compile error: {message}")]
    Compile { message: String },

    /// The compiler consumed all input mid-construct (REPL only)
    #[error("Unexpected end of input")]
    UnexpectedEof,

    /// A runtime error carried by the fiber
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Invalid operand for an instruction
    #[error("Invalid operand: expected {expected}, got {actual}")]
    InvalidOperand { expected: String, actual: String },

    /// Malformed bytecode
    #[error("Invalid bytecode: {reason}")]
    InvalidBytecode { reason: String },

    /// A host callback reported failure
    #[error("Host error: {message}")]
    Host { message: String },
}

impl VmError {
    /// Creates a compile error with the given message.
    pub fn compile(message: impl Into<String>) -> Self {
        VmError::Compile {
            message: message.into(),
        }
    }

    /// Creates a runtime error with the given message.
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            message: message.into(),
        }
    }

    /// Creates an invalid-bytecode error with the given reason.
    pub fn invalid_bytecode(reason: impl Into<String>) -> Self {
        VmError::InvalidBytecode {
            reason: reason.into(),
        }
    }

    /// Creates a host error with the given message.
    pub fn host(message: impl Into<String>) -> Self {
        VmError::Host {
            message: message.into(),
        }
    }
}

/// Result type used throughout the VM.
pub type VmResult<T> = Result<T, VmError>;

/// Outcome of compiling or running a script, a function or an expression.
///
/// The discriminants double as process exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum RunResult {
    /// Execution finished successfully.
    #[display(fmt = "success")]
    Success = 0,

    /// Unexpected EOF while compiling. Only reported when compiling in REPL
    /// mode, where it asks the host to append another input line; outside
    /// the REPL it is a compile error.
    #[display(fmt = "unexpected eof")]
    UnexpectedEof = 1,

    /// Compilation failed.
    #[display(fmt = "compile error")]
    CompileError = 2,

    /// An error occurred at runtime.
    #[display(fmt = "runtime error")]
    RuntimeError = 3,
}

impl RunResult {
    /// Returns `true` when execution finished without an error.
    pub fn is_success(self) -> bool {
        self == RunResult::Success
    }

    /// The process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = VmError::runtime("division by zero");
        assert_eq!(err.to_string(), "Runtime error: division by zero");

        let err = VmError::compile("unexpected token");
        assert_eq!(err.to_string(), "Compile error: unexpected token");
    }

    #[test]
    fn test_run_result_exit_codes() {
        assert_eq!(RunResult::Success.exit_code(), 0);
        assert_eq!(RunResult::UnexpectedEof.exit_code(), 1);
        assert_eq!(RunResult::CompileError.exit_code(), 2);
        assert_eq!(RunResult::RuntimeError.exit_code(), 3);
        assert!(RunResult::Success.is_success());
        assert!(!RunResult::RuntimeError.is_success());
    }
}
