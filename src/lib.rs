//! # Wisp Virtual Machine
//!
//! The runtime engine of the Wisp scripting language: a register/stack
//! hybrid bytecode VM with NaN-boxed values, a precise mark-and-sweep
//! garbage collector, first-class cooperative fibers with closures and
//! upvalues, a single-inheritance class model with magic-method dispatch,
//! and a slot-indexed embedding API for native host code.
//!
//! ## Architecture
//!
//! - **Var**: 64-bit NaN-boxed value (number, singleton or heap reference)
//! - **Heap**: the object arena, allocation list and handle slab
//! - **Gc**: tri-color mark-and-sweep with a worklist and temp references
//! - **Fiber**: coroutine value/call stacks and open-upvalue bookkeeping
//! - **Dispatch**: the bytecode interpreter loop and operator semantics
//! - **Slots**: the indexed argument/return protocol for native functions
//! - **BytecodeBuilder**: programmatic function construction for embedders
//!
//! ## Example
//!
//! ```rust,no_run
//! use wisp_vm::{BytecodeBuilder, OpCode, Vm};
//!
//! let mut vm = Vm::default();
//! let module = vm.new_module();
//! let module_handle = vm.new_handle(wisp_vm::Var::object(module));
//!
//! // print(1 + 2)
//! let mut builder = BytecodeBuilder::main(&mut vm, module);
//! let print = builder.vm().find_builtin_fn("print").unwrap().0 as u8;
//! builder.op_u8(OpCode::PushBuiltinFn, print);
//! builder.push_number(1.0);
//! builder.push_number(2.0);
//! builder.op(OpCode::Add);
//! builder.op_u8(OpCode::Call, 1);
//! builder.op(OpCode::Pop);
//! builder.finish();
//!
//! vm.run_module(module);
//! vm.release_handle(module_handle);
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Programmatic bytecode construction
pub mod builder;
/// Power-of-two growable buffers backing the intrinsic containers
pub mod buffer;
/// Builtin classes and core native functions
pub mod core;
/// Error types and run results
pub mod error;
/// Fibers, call frames and upvalue bookkeeping
pub mod fiber;
/// Mark-and-sweep garbage collection
pub mod gc;
/// The object arena, allocation list and handles
pub mod heap;
/// Host configuration callbacks
pub mod host;
/// Heap object variants
pub mod object;
/// Opcode definitions and instruction decoding
pub mod op_code;
/// Instruction dispatch and operator semantics
pub mod runtime;
/// The slot API for native functions
pub mod slots;
/// NaN-boxed value representation
pub mod value;
/// The virtual machine
pub mod vm;

pub use builder::BytecodeBuilder;
pub use error::{RunResult, VmError, VmResult};
pub use fiber::{CallFrame, Fiber, FiberState};
pub use heap::{Handle, Heap};
pub use host::{CompileFn, CompileOptions, Configuration};
pub use object::{
    Class, Closure, DeleteInstanceFn, Function, Instance, List, MagicMethod, Map, MethodBind,
    Module, NativeFn, NewInstanceFn, Object, Range, Str, Upvalue,
};
pub use op_code::{Instruction, OpCode};
pub use value::{ObjRef, Var, VarKind};
pub use vm::Vm;
