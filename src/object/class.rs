//! Classes, instances and the magic-method cache.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::buffer::Buffer;
use crate::object::Object;
use crate::value::{ObjRef, Var, VarKind};
use crate::vm::Vm;

/// Allocates the native payload of a new instance. Called while the
/// instance is being constructed; the returned data stays alive until the
/// delete callback runs.
pub type NewInstanceFn = fn(&mut Vm) -> Option<Box<dyn std::any::Any>>;

/// Releases the native payload of an instance. Invoked during garbage
/// collection; object allocation is not allowed inside.
pub type DeleteInstanceFn = fn(&mut Vm, Box<dyn std::any::Any>);

/// Methods invoked implicitly by operators and protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MagicMethod {
    Init = 0,
    Str,
    Repr,
    Getter,
    Setter,
    Call,
    Next,
    Value,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Gt,
    Lt,
    SubscriptGet,
    SubscriptSet,
}

/// Number of magic methods, the size of the per-class cache.
pub const MAGIC_METHOD_COUNT: usize = MagicMethod::SubscriptSet as usize + 1;

static MAGIC_METHOD_NAMES: Lazy<HashMap<&'static str, MagicMethod>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert("_init", MagicMethod::Init);
    table.insert("_str", MagicMethod::Str);
    table.insert("_repr", MagicMethod::Repr);
    table.insert("_getter", MagicMethod::Getter);
    table.insert("_setter", MagicMethod::Setter);
    table.insert("_call", MagicMethod::Call);
    table.insert("_next", MagicMethod::Next);
    table.insert("_value", MagicMethod::Value);
    table.insert("+", MagicMethod::Add);
    table.insert("-", MagicMethod::Sub);
    table.insert("*", MagicMethod::Mul);
    table.insert("/", MagicMethod::Div);
    table.insert("==", MagicMethod::Eq);
    table.insert(">", MagicMethod::Gt);
    table.insert("<", MagicMethod::Lt);
    table.insert("[]", MagicMethod::SubscriptGet);
    table.insert("[]=", MagicMethod::SubscriptSet);
    table
});

impl MagicMethod {
    /// Maps a method name to its magic slot, if it is one.
    pub fn from_name(name: &str) -> Option<MagicMethod> {
        MAGIC_METHOD_NAMES.get(name).copied()
    }
}

/// One entry of the per-class magic-method cache.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MagicSlot {
    /// Not looked up yet.
    Unresolved,
    /// Looked up; the chain has no such method.
    Absent,
    /// The resolved method closure.
    Method(ObjRef),
}

/// A class: methods, static attributes and single inheritance.
pub struct Class {
    /// The class name.
    pub name: ObjRef,
    /// Owner module. Builtin classes have none.
    pub owner: Option<ObjRef>,
    /// The super class; only the root `Object` class has none. The chain is
    /// acyclic and terminates at `Object`.
    pub super_class: Option<ObjRef>,
    /// The builtin kind this class wraps, or `Instance` for user classes.
    pub class_of: VarKind,
    /// Method closures, `is_method` set on each.
    pub methods: Buffer<ObjRef>,
    /// Static attribute map.
    pub static_attribs: ObjRef,
    /// Cache for magic-method resolution along the super chain.
    pub magic_methods: [MagicSlot; MAGIC_METHOD_COUNT],
    /// Native payload constructor for host-backed instances.
    pub new_fn: Option<NewInstanceFn>,
    /// Native payload destructor for host-backed instances.
    pub delete_fn: Option<DeleteInstanceFn>,
    /// Optional documentation.
    pub docstring: Option<String>,
}

impl Class {
    pub(crate) fn backing_bytes(&self) -> usize {
        self.methods.capacity() * std::mem::size_of::<ObjRef>()
    }
}

/// An instance of a user class.
pub struct Instance {
    /// The instance's class.
    pub class: ObjRef,
    /// The attribute map.
    pub attribs: ObjRef,
    /// Native payload created by the nearest ancestor `new_fn`.
    pub native: Option<Box<dyn std::any::Any>>,
}

impl Vm {
    /// Allocates a new class.
    ///
    /// With an owner module the name is interned there, the class enters
    /// the constant pool and becomes a module global; builtin classes pass
    /// no module and keep a free-standing name string.
    pub fn new_class(
        &mut self,
        name: &str,
        super_class: Option<ObjRef>,
        module: Option<ObjRef>,
        docstring: Option<&str>,
    ) -> ObjRef {
        // The static-attribute map is allocated first so the partially
        // built class never holds a dangling reference while a collection
        // can run.
        let static_attribs = self.new_map();
        self.push_temp_ref(static_attribs); // static_attribs.

        let name_ref = if let Some(module) = module {
            self.module_add_string(module, name).0
        } else {
            self.new_string(name)
        };
        self.push_temp_ref(name_ref); // name_ref.

        let cls = self.allocate(Object::Class(Class {
            name: name_ref,
            owner: module,
            super_class,
            class_of: VarKind::Instance,
            methods: Buffer::new(),
            static_attribs,
            magic_methods: [MagicSlot::Unresolved; MAGIC_METHOD_COUNT],
            new_fn: None,
            delete_fn: None,
            docstring: docstring.map(str::to_string),
        }));

        self.pop_temp_ref(); // name_ref.
        self.pop_temp_ref(); // static_attribs.

        if let Some(module) = module {
            self.push_temp_ref(cls); // cls.
            self.module_add_constant(module, Var::object(cls));
            self.module_set_global(module, name, Var::object(cls));
            self.pop_temp_ref(); // cls.
        }

        cls
    }

    /// Allocates a new instance of a user class, walking the super chain
    /// for the nearest native payload constructor.
    pub fn new_instance_of(&mut self, cls: ObjRef) -> ObjRef {
        debug_assert!(
            self.heap.class(cls).class_of == VarKind::Instance,
            "Cannot create an instance of a builtin class here."
        );

        let attribs = self.new_map();
        self.push_temp_ref(attribs); // attribs.

        let instance = self.allocate(Object::Instance(Instance {
            class: cls,
            attribs,
            native: None,
        }));
        self.pop_temp_ref(); // attribs.
        self.push_temp_ref(instance); // instance.

        let mut walk = Some(cls);
        while let Some(current) = walk {
            if let Some(new_fn) = self.heap.class(current).new_fn {
                let native = new_fn(self);
                self.heap.instance_mut(instance).native = native;
                break;
            }
            walk = self.heap.class(current).super_class;
        }

        self.pop_temp_ref(); // instance.
        instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_method_names() {
        assert_eq!(MagicMethod::from_name("_init"), Some(MagicMethod::Init));
        assert_eq!(MagicMethod::from_name("+"), Some(MagicMethod::Add));
        assert_eq!(MagicMethod::from_name("[]="), Some(MagicMethod::SubscriptSet));
        assert_eq!(MagicMethod::from_name("frobnicate"), None);
    }
}
