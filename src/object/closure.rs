//! Closures, upvalues and method binds.

use crate::object::Object;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// A function paired with its captured upvalues.
pub struct Closure {
    /// The wrapped function.
    pub function: ObjRef,
    /// Captured upvalues; the length always equals the function's
    /// `upvalue_count`.
    pub upvalues: Vec<ObjRef>,
}

/// Where an upvalue's value currently lives.
#[derive(Clone, Copy)]
pub enum UpvalueSlot {
    /// Pointing at a live stack slot of the owning fiber. The owner is
    /// recorded because a closure may run on a different fiber while the
    /// capture is still open.
    Open { owner: ObjRef, index: usize },
    /// The frame returned; the value moved into the upvalue itself.
    Closed(Var),
}

/// A capture cell. Open upvalues of a fiber are chained in descending
/// stack-index order so a single walk closes everything above a frame.
pub struct Upvalue {
    pub slot: UpvalueSlot,
    pub next: Option<ObjRef>,
}

/// A closure bound to a receiver. Methods are not first class; accessing
/// one on an instance produces a bind.
pub struct MethodBind {
    pub method: ObjRef,
    /// The bound receiver, or undefined while unbound.
    pub receiver: Var,
}

impl Vm {
    /// Allocates a closure over `function` with unfilled upvalue slots.
    pub fn new_closure(&mut self, function: ObjRef) -> ObjRef {
        let upvalue_count = self.heap.function(function).upvalue_count as usize;
        self.allocate(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }))
    }

    /// Allocates an upvalue open over stack slot `index` of `owner`.
    pub fn new_upvalue(&mut self, owner: ObjRef, index: usize) -> ObjRef {
        self.allocate(Object::Upvalue(Upvalue {
            slot: UpvalueSlot::Open { owner, index },
            next: None,
        }))
    }

    /// Allocates a method bind for `method`, initially unbound.
    pub fn new_method_bind(&mut self, method: ObjRef) -> ObjRef {
        self.allocate(Object::MethodBind(MethodBind {
            method,
            receiver: Var::UNDEFINED,
        }))
    }
}
