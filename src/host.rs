//! Host interface: the configuration callbacks a VM is built with.
//!
//! Everything the runtime needs from the outside world arrives through
//! this struct: I/O, script loading, path resolution, dynamic extension
//! loading and the external compiler. Every callback has a reasonable
//! default for a stand-alone process.

use std::io::{BufRead, Write};

use crate::error::RunResult;
use crate::value::ObjRef;
use crate::vm::Vm;

/// Writes `text` to the host's stdout or stderr.
pub type WriteFn = fn(&mut Vm, &str);

/// Reads one line from the host's stdin, without the line ending. `None`
/// means end of input.
pub type ReadFn = fn(&mut Vm) -> Option<String>;

/// Resolves an import path. `from` is the importing script's path, `None`
/// when the import is relative to the working directory. Returns the
/// normalized absolute path, or `None` on failure.
pub type ResolvePathFn = fn(&mut Vm, Option<&str>, &str) -> Option<String>;

/// Loads the entire source of the script at `path`. `None` on failure.
pub type LoadScriptFn = fn(&mut Vm, &str) -> Option<String>;

/// Opaque handle of a loaded native extension library.
pub type DlData = Box<dyn std::any::Any>;

/// Loads a native extension from `path`. `None` on failure; no error API
/// may be used inside.
pub type LoadDlFn = fn(&mut Vm, &str) -> Option<DlData>;

/// Imports the module of a loaded extension. Returns a handle to the
/// module object, `None` on failure.
pub type ImportDlFn = fn(&mut Vm, &dyn std::any::Any) -> Option<crate::heap::Handle>;

/// Releases a native extension once its module is finalized.
pub type UnloadDlFn = fn(&mut Vm, DlData);

/// Options the VM passes to the external compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// In REPL mode an unexpected end of input asks for more lines instead
    /// of failing.
    pub repl_mode: bool,
}

/// The interface the core requires from the external source-to-bytecode
/// compiler: populate `module` (globals, constants, the implicit `@main`
/// body) from `source`. The module itself is pinned by the caller; the
/// compiler must pin its own intermediate objects (temp references or
/// handles) across allocations.
pub type CompileFn = fn(&mut Vm, ObjRef, &str, &CompileOptions) -> RunResult;

/// VM construction parameters.
pub struct Configuration {
    pub stdout_write: Option<WriteFn>,
    pub stderr_write: Option<WriteFn>,
    pub stdin_read: Option<ReadFn>,

    pub resolve_path_fn: Option<ResolvePathFn>,
    pub load_script_fn: Option<LoadScriptFn>,

    pub load_dl_fn: Option<LoadDlFn>,
    pub import_dl_fn: Option<ImportDlFn>,
    pub unload_dl_fn: Option<UnloadDlFn>,

    /// The external compiler hook.
    pub compile_fn: Option<CompileFn>,

    /// Use ANSI color codes on stderr.
    pub use_ansi_escape: bool,

    /// Process arguments exposed to scripts.
    pub arguments: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            stdout_write: Some(default_stdout_write),
            stderr_write: Some(default_stderr_write),
            stdin_read: Some(default_stdin_read),
            resolve_path_fn: Some(default_resolve_path),
            load_script_fn: Some(default_load_script),
            load_dl_fn: None,
            import_dl_fn: None,
            unload_dl_fn: None,
            compile_fn: None,
            use_ansi_escape: false,
            arguments: Vec::new(),
        }
    }
}

fn default_stdout_write(_vm: &mut Vm, text: &str) {
    let _ = std::io::stdout().write_all(text.as_bytes());
}

fn default_stderr_write(_vm: &mut Vm, text: &str) {
    let _ = std::io::stderr().write_all(text.as_bytes());
}

fn default_stdin_read(_vm: &mut Vm) -> Option<String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Some(line)
        }
    }
}

fn default_resolve_path(_vm: &mut Vm, from: Option<&str>, path: &str) -> Option<String> {
    use std::path::{Path, PathBuf};

    let mut resolved = match from {
        Some(from) => {
            let mut base = PathBuf::from(from);
            base.pop();
            base.join(path)
        }
        None => PathBuf::from(path),
    };
    if resolved.extension().is_none() {
        resolved.set_extension("wisp");
    }
    if resolved.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            resolved = cwd.join(resolved);
        }
    }

    // Normalize away `.` and `..` without touching the filesystem.
    let mut normalized = PathBuf::new();
    for component in resolved.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    Path::new(&normalized).to_str().map(str::to_string)
}

fn default_load_script(_vm: &mut Vm, path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}
