//! Functions: native callbacks or compiled bytecode bodies.

use crate::buffer::Buffer;
use crate::object::Object;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// A native function callable by the VM. Arguments and the return value
/// travel through the slot API on [`Vm`].
pub type NativeFn = fn(&mut Vm);

/// Arity of a function that accepts any number of arguments.
pub const ARITY_VARIADIC: i32 = -1;

/// Arity sentinel for a function whose arity hasn't been set yet. Calling
/// such a function is a programmer error.
pub(crate) const ARITY_UNSET: i32 = -2;

/// The body of a bytecode function.
pub struct FnBody {
    /// The instruction stream.
    pub opcodes: Buffer<u8>,
    /// Source line of each instruction byte, parallel to `opcodes`.
    pub oplines: Buffer<u32>,
    /// Maximum number of stack slots the body needs.
    pub stack_size: u32,
}

impl FnBody {
    pub fn new() -> Self {
        Self {
            opcodes: Buffer::new(),
            oplines: Buffer::new(),
            stack_size: 0,
        }
    }
}

impl Default for FnBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Either a native pointer or a bytecode body; never both.
pub enum FunctionKind {
    Native(NativeFn),
    Bytecode(FnBody),
}

/// A function object. Owned by a module unless it is a builtin.
pub struct Function {
    /// The function name. Interned in the owner's constant pool when there
    /// is an owner.
    pub name: String,
    /// The owner module. Only builtin functions have none.
    pub owner: Option<ObjRef>,
    /// Number of parameters, or [`ARITY_VARIADIC`].
    pub arity: i32,
    /// Number of upvalues the function captures.
    pub upvalue_count: u32,
    /// Methods receive an implicit receiver.
    pub is_method: bool,
    /// Optional documentation shown by the REPL's help.
    pub docstring: Option<String>,
    pub kind: FunctionKind,
}

impl Function {
    /// Returns `true` for native functions.
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native(_))
    }

    /// The bytecode body. Panics on native functions.
    pub fn body(&self) -> &FnBody {
        match &self.kind {
            FunctionKind::Bytecode(body) => body,
            FunctionKind::Native(_) => unreachable!("Native function has no bytecode body."),
        }
    }

    /// The bytecode body, mutable. Panics on native functions.
    pub fn body_mut(&mut self) -> &mut FnBody {
        match &mut self.kind {
            FunctionKind::Bytecode(body) => body,
            FunctionKind::Native(_) => unreachable!("Native function has no bytecode body."),
        }
    }

    pub(crate) fn backing_bytes(&self) -> usize {
        match &self.kind {
            FunctionKind::Bytecode(body) => {
                body.opcodes.capacity() + body.oplines.capacity() * std::mem::size_of::<u32>()
            }
            FunctionKind::Native(_) => 0,
        }
    }
}

impl Vm {
    /// Allocates a new function.
    ///
    /// With an owner module the function is added to the module's constant
    /// pool and its name is interned there; only builtin functions may omit
    /// the owner. The arity starts unset and must be assigned before the
    /// function becomes callable.
    pub fn new_function(
        &mut self,
        name: &str,
        owner: Option<ObjRef>,
        kind: FunctionKind,
        docstring: Option<&str>,
    ) -> ObjRef {
        debug_assert!(
            owner.is_some() || matches!(kind, FunctionKind::Native(_)),
            "Only builtin functions may omit an owner module."
        );

        let function = self.allocate(Object::Function(Function {
            name: name.to_string(),
            owner,
            arity: ARITY_UNSET,
            upvalue_count: 0,
            is_method: false,
            docstring: docstring.map(str::to_string),
            kind,
        }));

        if let Some(owner) = owner {
            self.push_temp_ref(function); // function.
            self.module_add_constant(owner, Var::object(function));
            self.pop_temp_ref(); // function.
        }

        function
    }
}
