//! Heap object model for the Wisp VM.
//!
//! Every heap value is one variant of [`Object`]. The common header (mark
//! bit, next-in-allocation-list) lives on the arena slot, not here; see
//! [`crate::heap`].

pub mod class;
pub mod closure;
pub mod function;
pub mod list;
pub mod map;
pub mod module;
pub mod range;
pub mod string;

pub use class::{Class, DeleteInstanceFn, Instance, MagicMethod, MagicSlot, NewInstanceFn};
pub use closure::{Closure, MethodBind, Upvalue, UpvalueSlot};
pub use function::{FnBody, Function, FunctionKind, NativeFn};
pub use list::List;
pub use map::{Map, MapEntry};
pub use module::Module;
pub use range::Range;
pub use string::Str;

use crate::fiber::Fiber;
use crate::value::VarKind;

/// A heap allocated object, tagged by variant.
pub enum Object {
    String(Str),
    List(List),
    Map(Map),
    Range(Range),
    Module(Module),
    Function(Function),
    Closure(Closure),
    MethodBind(MethodBind),
    Upvalue(Upvalue),
    Fiber(Fiber),
    Class(Class),
    Instance(Instance),
}

impl Object {
    /// The first-class kind of this object.
    ///
    /// Functions and upvalues are implementation details without a
    /// first-class kind; asking for theirs is a programmer error.
    pub fn kind(&self) -> VarKind {
        match self {
            Object::String(_) => VarKind::String,
            Object::List(_) => VarKind::List,
            Object::Map(_) => VarKind::Map,
            Object::Range(_) => VarKind::Range,
            Object::Module(_) => VarKind::Module,
            Object::Closure(_) => VarKind::Closure,
            Object::MethodBind(_) => VarKind::MethodBind,
            Object::Fiber(_) => VarKind::Fiber,
            Object::Class(_) => VarKind::Class,
            Object::Instance(_) => VarKind::Instance,
            Object::Function(_) | Object::Upvalue(_) => {
                unreachable!("Functions and upvalues are not first class.")
            }
        }
    }

    /// The display name of this object's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "String",
            Object::List(_) => "List",
            Object::Map(_) => "Map",
            Object::Range(_) => "Range",
            Object::Module(_) => "Module",
            Object::Function(_) => "Func",
            Object::Closure(_) => "Closure",
            Object::MethodBind(_) => "MethodBind",
            Object::Upvalue(_) => "Upvalue",
            Object::Fiber(_) => "Fiber",
            Object::Class(_) => "Class",
            Object::Instance(_) => "Inst",
        }
    }

    /// Only strings, ranges and classes are hashable objects (they are
    /// immutable).
    pub fn is_hashable(&self) -> bool {
        matches!(
            self,
            Object::String(_) | Object::Range(_) | Object::Class(_)
        )
    }

    /// Shallow byte footprint of this object: the variant itself plus the
    /// backing stores it exclusively owns. Interior objects are accounted
    /// by their own entries. Used both at allocation and when the mark
    /// phase recomputes the live-byte total.
    pub fn shallow_size(&self) -> usize {
        use std::mem::size_of;
        let base = size_of::<Object>();
        base + match self {
            Object::String(s) => s.as_str().len(),
            Object::List(l) => l.elements.capacity() * size_of::<crate::value::Var>(),
            Object::Map(m) => m.entry_bytes(),
            Object::Range(_) => 0,
            Object::Module(m) => m.backing_bytes(),
            Object::Function(f) => f.backing_bytes(),
            Object::Closure(c) => c.upvalues.len() * size_of::<crate::value::ObjRef>(),
            Object::MethodBind(_) => 0,
            Object::Upvalue(_) => 0,
            Object::Fiber(f) => f.backing_bytes(),
            Object::Class(c) => c.backing_bytes(),
            Object::Instance(_) => 0,
        }
    }
}
