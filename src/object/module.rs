//! Modules: globals, constants and the implicit main closure.

use crate::object::function::{FunctionKind, FnBody};
use crate::object::Object;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// Names which are internal or special start with this character (`@main`,
/// `@anonymous`). Wildcard imports skip them.
pub const SPECIAL_NAME_CHAR: char = '@';

/// Name of the implicit function wrapping a module's top-level statements.
pub const IMPLICIT_MAIN_NAME: &str = "@main";

/// Name shared by all literal (anonymous) functions; they are identified by
/// their constant-pool index.
pub const LITERAL_FN_NAME: &str = "@anonymous";

/// Handle to a loaded native extension library, released when the module is
/// finalized.
pub struct DlHandle(pub Box<dyn std::any::Any>);

/// A compiled script or a natively registered module.
pub struct Module {
    /// Module name. Native modules always have one; compiled scripts may
    /// only have a path.
    pub name: Option<ObjRef>,
    /// Normalized absolute path of a compiled script.
    pub path: Option<ObjRef>,
    /// Global values, parallel to `global_names`.
    pub globals: crate::buffer::Buffer<Var>,
    /// Constant-pool indices of the global names, parallel to `globals`.
    pub global_names: crate::buffer::Buffer<u32>,
    /// The constant pool. Also interns strings.
    pub constants: crate::buffer::Buffer<Var>,
    /// The implicit main closure holding the top-level statements.
    pub body: Option<ObjRef>,
    /// Set just before the body runs, so cyclic imports don't re-enter.
    pub initialized: bool,
    /// Native extension library handle, if this module came from one.
    pub dl_handle: Option<DlHandle>,
}

impl Module {
    pub(crate) fn backing_bytes(&self) -> usize {
        use std::mem::size_of;
        self.globals.capacity() * size_of::<Var>()
            + self.global_names.capacity() * size_of::<u32>()
            + self.constants.capacity() * size_of::<Var>()
    }
}

impl Vm {
    /// Allocates a new empty module.
    pub fn new_module(&mut self) -> ObjRef {
        self.allocate(Object::Module(Module {
            name: None,
            path: None,
            globals: crate::buffer::Buffer::new(),
            global_names: crate::buffer::Buffer::new(),
            constants: crate::buffer::Buffer::new(),
            body: None,
            initialized: false,
            dl_handle: None,
        }))
    }

    /// Adds `value` to the module's constant pool, de-duplicating by value
    /// identity. Returns the constant index.
    pub fn module_add_constant(&mut self, module: ObjRef, value: Var) -> u32 {
        {
            let m = self.heap.module(module);
            for (i, constant) in m.constants.iter().enumerate() {
                if constant.same(value) {
                    return i as u32;
                }
            }
        }
        let grown = self.heap.module_mut(module).constants.write(value);
        self.heap.add_bytes(grown);
        (self.heap.module(module).constants.count() - 1) as u32
    }

    /// Interns `name` in the module's constant pool and returns the string
    /// object together with its constant index.
    pub fn module_add_string(&mut self, module: ObjRef, name: &str) -> (ObjRef, u32) {
        {
            let m = self.heap.module(module);
            for (i, constant) in m.constants.iter().enumerate() {
                if !constant.is_obj() {
                    continue;
                }
                if let Object::String(s) = self.heap.get(constant.as_obj()) {
                    if s.as_str() == name {
                        return (constant.as_obj(), i as u32);
                    }
                }
            }
        }

        let interned = self.new_string(name);
        self.push_temp_ref(interned); // interned.
        let grown = self
            .heap
            .module_mut(module)
            .constants
            .write(Var::object(interned));
        self.heap.add_bytes(grown);
        self.pop_temp_ref(); // interned.
        let index = (self.heap.module(module).constants.count() - 1) as u32;
        (interned, index)
    }

    /// Returns the string at constant index `index`, or `None` when the
    /// index is out of range or not a string.
    pub fn module_get_string_at(&self, module: ObjRef, index: usize) -> Option<ObjRef> {
        let m = self.heap.module(module);
        if index >= m.constants.count() {
            return None;
        }
        let constant = m.constants[index];
        if !constant.is_obj() {
            return None;
        }
        match self.heap.get(constant.as_obj()) {
            Object::String(_) => Some(constant.as_obj()),
            _ => None,
        }
    }

    /// Sets the global named `name`, updating in place or appending a new
    /// global. Returns the global index.
    pub fn module_set_global(&mut self, module: ObjRef, name: &str, value: Var) -> u32 {
        if let Some(index) = self.module_get_global_index(module, name) {
            self.heap.module_mut(module).globals[index as usize] = value;
            return index;
        }

        let (_, name_index) = self.module_add_string(module, name);
        let m = self.heap.module_mut(module);
        let grown = m.global_names.write(name_index) + m.globals.write(value);
        self.heap.add_bytes(grown);
        (self.heap.module(module).globals.count() - 1) as u32
    }

    /// Linear-searches the global name table. Returns the global index of
    /// `name` when present.
    pub fn module_get_global_index(&self, module: ObjRef, name: &str) -> Option<u32> {
        let m = self.heap.module(module);
        for (i, name_index) in m.global_names.iter().enumerate() {
            let g_name = self
                .module_get_string_at(module, *name_index as usize)
                .expect("Global name indices always point at interned strings.");
            if self.heap.string(g_name).as_str() == name {
                return Some(i as u32);
            }
        }
        None
    }

    /// Returns the value of the global named `name` when present.
    pub fn module_get_global(&self, module: ObjRef, name: &str) -> Option<Var> {
        self.module_get_global_index(module, name)
            .map(|i| self.heap.module(module).globals[i as usize])
    }

    /// Creates the implicit `@main` body closure wrapping the module's
    /// top-level statements.
    pub fn module_add_main(&mut self, module: ObjRef) {
        debug_assert!(self.heap.module(module).body.is_none());

        self.heap.module_mut(module).initialized = false;

        let body_fn = self.new_function(
            IMPLICIT_MAIN_NAME,
            Some(module),
            FunctionKind::Bytecode(FnBody::new()),
            None,
        );
        self.heap.function_mut(body_fn).arity = 0;

        self.push_temp_ref(body_fn); // body_fn.
        let body = self.new_closure(body_fn);
        self.heap.module_mut(module).body = Some(body);
        self.pop_temp_ref(); // body_fn.

        self.module_set_global(module, IMPLICIT_MAIN_NAME, Var::object(body));
    }
}
