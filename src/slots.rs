//! The slot API: how native functions exchange values with the VM.
//!
//! A native sees the current fiber's stack as a zero-indexed window of
//! slots starting at the return slot: slot 0 is the return value, slots
//! `1..=argc` are the arguments. Slot indices are validated with debug
//! assertions; type mismatches in the `validate_*` helpers set a runtime
//! error and report failure, so natives can bail out with `return`.

use crate::heap::Handle;
use crate::object::Object;
use crate::runtime::operators;
use crate::value::{ObjRef, Var, VarKind};
use crate::vm::Vm;

macro_rules! validate_slot_index {
    ($vm:expr, $index:expr) => {
        debug_assert!(
            $index < $vm.slots_count(),
            "Slot index is too large. Did you forget to call reserve_slots()?"
        );
    };
}

impl Vm {
    fn slots_fiber(&self) -> ObjRef {
        self.fiber
            .expect("No fiber exists. Did you forget to call reserve_slots()?")
    }

    /// Makes sure the fiber has `count` slots to work with, including the
    /// arguments. May grow the stack.
    pub fn reserve_slots(&mut self, count: usize) {
        if self.fiber.is_none() {
            let fiber = self.new_fiber(None);
            self.fiber = Some(fiber);
        }
        let fiber = self.slots_fiber();
        let needed = self.heap.fiber(fiber).ret + count;
        self.ensure_stack_size(fiber, needed);
    }

    /// The number of usable slots: at least the registered arity plus one
    /// for the return value.
    pub fn slots_count(&self) -> usize {
        let fiber = self.slots_fiber();
        let fb = self.heap.fiber(fiber);
        fb.stack.len() - fb.ret
    }

    /// The current call's argument count, for variadic natives.
    pub fn arg_count(&self) -> usize {
        let fiber = self.slots_fiber();
        let fb = self.heap.fiber(fiber);
        fb.sp - fb.ret - 1
    }

    /// Checks `min <= argc <= max`, setting a runtime error outside the
    /// range.
    pub fn check_argc_range(&mut self, argc: usize, min: usize, max: usize) -> bool {
        debug_assert!(min <= max, "Invalid argc range (min > max).");
        if argc < min {
            self.set_runtime_error(format!("Expected at least {min} argument(s)."));
            return false;
        }
        if argc > max {
            self.set_runtime_error(format!("Expected at most {max} argument(s)."));
            return false;
        }
        true
    }

    /// Reads a slot.
    pub fn get_slot(&self, index: usize) -> Var {
        validate_slot_index!(self, index);
        let fiber = self.slots_fiber();
        let fb = self.heap.fiber(fiber);
        fb.stack[fb.ret + index]
    }

    /// Writes a slot.
    pub fn set_slot(&mut self, index: usize, value: Var) {
        validate_slot_index!(self, index);
        let fiber = self.slots_fiber();
        let fb = self.heap.fiber_mut(fiber);
        let at = fb.ret + index;
        fb.stack[at] = value;
    }

    /// The kind of the value at `index`.
    pub fn slot_kind(&self, index: usize) -> VarKind {
        self.heap.kind_of(self.get_slot(index))
    }

    /// The truthiness of the value at `index` (casts non-booleans).
    pub fn get_slot_bool(&self, index: usize) -> bool {
        self.heap.to_bool(self.get_slot(index))
    }

    /// The number at `index`. A non-number is a programmer error.
    pub fn get_slot_number(&self, index: usize) -> f64 {
        let value = self.get_slot(index);
        debug_assert!(value.is_num(), "Slot value wasn't a Number.");
        value.as_num()
    }

    /// The string at `index`. Only valid until the next allocation can
    /// move the collector; copy out anything long-lived.
    pub fn get_slot_string(&self, index: usize) -> &str {
        let value = self.get_slot(index);
        debug_assert!(
            value.is_obj() && matches!(self.heap.get(value.as_obj()), Object::String(_)),
            "Slot value wasn't a String."
        );
        self.heap.string(value.as_obj()).as_str()
    }

    /// Captures the value at `index` in a handle so it survives across
    /// native calls.
    pub fn get_slot_handle(&mut self, index: usize) -> Handle {
        let value = self.get_slot(index);
        self.new_handle(value)
    }

    /// The native payload of the instance at `index`. An instance without
    /// a payload is a programmer error.
    pub fn get_slot_native_instance(&self, index: usize) -> &dyn std::any::Any {
        let value = self.get_slot(index);
        debug_assert!(
            value.is_obj() && matches!(self.heap.get(value.as_obj()), Object::Instance(_)),
            "Slot value wasn't an Instance."
        );
        self.heap
            .instance(value.as_obj())
            .native
            .as_deref()
            .expect("Slot value wasn't a native Instance.")
    }

    /// The hash of the value at `index`; the value must be hashable.
    pub fn get_slot_hash(&self, index: usize) -> u32 {
        let value = self.get_slot(index);
        debug_assert!(self.heap.is_hashable(value));
        self.heap.hash_value(value)
    }

    /// The receiver of the current method call.
    pub fn receiver(&self) -> Var {
        let fiber = self.slots_fiber();
        self.heap.fiber(fiber).receiver
    }

    /// The native payload of the receiver of the current method call.
    pub fn native_receiver(&self) -> &dyn std::any::Any {
        let fiber = self.slots_fiber();
        let receiver = self.heap.fiber(fiber).receiver;
        debug_assert!(
            receiver.is_obj() && matches!(self.heap.get(receiver.as_obj()), Object::Instance(_))
        );
        self.heap
            .instance(receiver.as_obj())
            .native
            .as_deref()
            .expect("Receiver has no native payload.")
    }

    /// Places the current method receiver at `index`.
    pub fn place_receiver(&mut self, index: usize) {
        let fiber = self.slots_fiber();
        let receiver = self.heap.fiber(fiber).receiver;
        self.set_slot(index, receiver);
    }

    // Validators: set a runtime error and report failure on mismatch.

    /// Checks that slot `index` holds a boolean.
    pub fn validate_slot_bool(&mut self, index: usize) -> Option<bool> {
        let value = self.get_slot(index);
        if !value.is_bool() {
            self.invalid_slot_type(index, "Boolean");
            return None;
        }
        Some(value.as_bool())
    }

    /// Checks that slot `index` holds a number.
    pub fn validate_slot_number(&mut self, index: usize) -> Option<f64> {
        let value = self.get_slot(index);
        if !value.is_num() {
            self.invalid_slot_type(index, "Number");
            return None;
        }
        Some(value.as_num())
    }

    /// Checks that slot `index` holds a whole number.
    pub fn validate_slot_integer(&mut self, index: usize) -> Option<i32> {
        let value = self.validate_slot_number(index)?;
        if value.floor() != value {
            self.set_runtime_error("Expected an integer got float.");
            return None;
        }
        Some(value as i32)
    }

    /// Checks that slot `index` holds a string.
    pub fn validate_slot_string(&mut self, index: usize) -> Option<&str> {
        let value = self.get_slot(index);
        if !value.is_obj() || !matches!(self.heap.get(value.as_obj()), Object::String(_)) {
            self.invalid_slot_type(index, "String");
            return None;
        }
        Some(self.heap.string(value.as_obj()).as_str())
    }

    /// Checks that slot `index` holds a value of `kind`.
    pub fn validate_slot_kind(&mut self, index: usize, kind: VarKind) -> bool {
        if self.slot_kind(index) != kind {
            self.invalid_slot_type(index, &kind.to_string());
            return false;
        }
        true
    }

    /// Checks that the value at `index` is an instance of the class at
    /// `cls`.
    pub fn validate_slot_instance_of(&mut self, index: usize, cls: usize) -> bool {
        let value = self.get_slot(index);
        let class_ = self.get_slot(cls);
        match operators::var_is_type(self, value, class_) {
            Some(true) => true,
            Some(false) => {
                let name = self
                    .heap
                    .string(self.heap.class(class_.as_obj()).name)
                    .as_str()
                    .to_string();
                self.invalid_slot_type(index, &name);
                false
            }
            // An invalid class operand is already an error.
            None => false,
        }
    }

    /// Like [`Self::validate_slot_instance_of`] but reports the check
    /// outcome instead of erroring on mismatch.
    pub fn is_slot_instance_of(&mut self, inst: usize, cls: usize) -> Option<bool> {
        let value = self.get_slot(inst);
        let class_ = self.get_slot(cls);
        operators::var_is_type(self, value, class_)
    }

    fn invalid_slot_type(&mut self, index: usize, type_name: &str) {
        self.set_runtime_error(format!("Argument {index} must be a {type_name}."));
    }

    // Setters for builtin value types never fail; setters that allocate
    // may trigger a collection.

    /// Sets slot `index` to null.
    pub fn set_slot_null(&mut self, index: usize) {
        self.set_slot(index, Var::NULL);
    }

    /// Sets slot `index` to a boolean.
    pub fn set_slot_bool(&mut self, index: usize, value: bool) {
        self.set_slot(index, Var::bool(value));
    }

    /// Sets slot `index` to a number.
    pub fn set_slot_number(&mut self, index: usize, value: f64) {
        self.set_slot(index, Var::number(value));
    }

    /// Sets slot `index` to a new string copying `value`.
    pub fn set_slot_string(&mut self, index: usize, value: &str) {
        let string = self.new_string(value);
        self.set_slot(index, Var::object(string));
    }

    /// Sets slot `index` to the value a handle pins. The handle stays
    /// owned by the caller.
    pub fn set_slot_handle(&mut self, index: usize, handle: &Handle) {
        let value = self.handle_value(handle);
        self.set_slot(index, value);
    }

    /// Creates a new list at slot `index`.
    pub fn slot_new_list(&mut self, index: usize) {
        let list = self.new_list(0);
        self.set_slot(index, Var::object(list));
    }

    /// Creates a new map at slot `index`.
    pub fn slot_new_map(&mut self, index: usize) {
        let map = self.new_map();
        self.set_slot(index, Var::object(map));
    }

    /// Creates a new range at slot `index`.
    pub fn slot_new_range(&mut self, index: usize, first: f64, last: f64) {
        let range = self.new_range(first, last);
        self.set_slot(index, Var::object(range));
    }

    /// Constructs an instance of the class at `cls` with arguments in
    /// slots `[argv, argv + argc)` and places it at `index`.
    pub fn slot_new_instance(&mut self, cls: usize, index: usize, argc: usize, argv: usize) -> bool {
        if argc != 0 {
            validate_slot_index!(self, argv);
            validate_slot_index!(self, argv + argc - 1);
        }
        let class_ = self.get_slot(cls);
        debug_assert!(
            class_.is_obj() && matches!(self.heap.get(class_.as_obj()), Object::Class(_)),
            "Slot value wasn't a Class."
        );

        let args: Vec<Var> = (argv..argv + argc).map(|i| self.get_slot(i)).collect();
        match operators::construct_instance(self, class_.as_obj(), &args) {
            Some(instance) => {
                self.set_slot(index, instance);
                true
            }
            None => false,
        }
    }

    /// Inserts the value at slot `value` into the list at slot `list`.
    /// Negative indices count from the end (`-1` appends).
    pub fn slot_list_insert(&mut self, list: usize, index: i32, value: usize) -> bool {
        let list_var = self.get_slot(list);
        debug_assert!(
            list_var.is_obj() && matches!(self.heap.get(list_var.as_obj()), Object::List(_)),
            "Slot value wasn't a List."
        );
        let list_obj = list_var.as_obj();
        let length = self.heap.list(list_obj).len() as i32;

        let index = if index < 0 { length + index + 1 } else { index };
        if index < 0 || index > length {
            self.set_runtime_error("Index out of bounds.");
            return false;
        }

        let value = self.get_slot(value);
        self.list_insert_at(list_obj, index as usize, value);
        true
    }

    /// Pops the element at `index` from the list at slot `list`, placing
    /// it at slot `popped` when given.
    pub fn slot_list_pop(&mut self, list: usize, index: i32, popped: Option<usize>) -> bool {
        let list_var = self.get_slot(list);
        debug_assert!(
            list_var.is_obj() && matches!(self.heap.get(list_var.as_obj()), Object::List(_)),
            "Slot value wasn't a List."
        );
        let list_obj = list_var.as_obj();
        let length = self.heap.list(list_obj).len() as i32;

        let index = if index < 0 { length + index } else { index };
        if index < 0 || index >= length {
            self.set_runtime_error("Index out of bounds.");
            return false;
        }

        let value = self.list_remove_at(list_obj, index as usize);
        if let Some(popped) = popped {
            self.set_slot(popped, value);
        }
        true
    }

    /// The length of the list at slot `list`.
    pub fn slot_list_length(&self, list: usize) -> usize {
        let list_var = self.get_slot(list);
        debug_assert!(
            list_var.is_obj() && matches!(self.heap.get(list_var.as_obj()), Object::List(_)),
            "Slot value wasn't a List."
        );
        self.heap.list(list_var.as_obj()).len()
    }

    /// Calls the callable at slot `callable` with arguments in slots
    /// `[argv, argv + argc)`. The return value lands at `ret` when given.
    /// A class constructs an instance.
    pub fn slot_call_function(
        &mut self,
        callable: usize,
        argc: usize,
        argv: usize,
        ret: Option<usize>,
    ) -> bool {
        if argc != 0 {
            validate_slot_index!(self, argv);
            validate_slot_index!(self, argv + argc - 1);
        }

        let callable_var = self.get_slot(callable);
        let args: Vec<Var> = (argv..argv + argc).map(|i| self.get_slot(i)).collect();

        if !callable_var.is_obj() {
            self.set_runtime_error("Expected a Callable.");
            return false;
        }
        let obj = callable_var.as_obj();
        let result = match self.heap.kind_of(callable_var) {
            VarKind::Class => operators::construct_instance(self, obj, &args),
            VarKind::Closure => {
                // Methods are not first class; calling one without a
                // receiver goes through a method bind.
                let function = self.heap.closure(obj).function;
                debug_assert!(!self.heap.function(function).is_method);
                self.call_function(obj, &args)
            }
            VarKind::MethodBind => {
                let (receiver, method) = {
                    let bind = self.heap.method_bind(obj);
                    (bind.receiver, bind.method)
                };
                if receiver.is_undef() {
                    self.set_runtime_error("Cannot call an unbound method bind.");
                    return false;
                }
                self.call_method(receiver, method, &args)
            }
            _ => {
                self.set_runtime_error("Expected a Callable.");
                return false;
            }
        };

        match result {
            Some(value) => {
                if let Some(ret) = ret {
                    self.set_slot(ret, value);
                }
                true
            }
            None => false,
        }
    }

    /// Calls the method named `method` on the value at slot `instance`.
    pub fn slot_call_method(
        &mut self,
        instance: usize,
        method: &str,
        argc: usize,
        argv: usize,
        ret: Option<usize>,
    ) -> bool {
        if argc != 0 {
            validate_slot_index!(self, argv);
            validate_slot_index!(self, argv + argc - 1);
        }

        let receiver = self.get_slot(instance);
        let args: Vec<Var> = (argv..argv + argc).map(|i| self.get_slot(i)).collect();

        let name = self.new_string(method);
        self.push_temp_ref(name); // name.
        let lookup = operators::get_method(self, receiver, name);
        self.pop_temp_ref(); // name.

        let result = match lookup {
            Some(operators::MethodLookup::Method(closure)) => {
                self.call_method(receiver, closure, &args)
            }
            Some(operators::MethodLookup::Attribute(value)) => {
                let kind = if value.is_obj() {
                    Some(self.heap.kind_of(value))
                } else {
                    None
                };
                match kind {
                    Some(VarKind::Class) => {
                        operators::construct_instance(self, value.as_obj(), &args)
                    }
                    Some(VarKind::Closure) => self.call_function(value.as_obj(), &args),
                    _ => {
                        self.set_runtime_error(format!(
                            "Instance has no method named '{method}'."
                        ));
                        return false;
                    }
                }
            }
            None => return false,
        };

        match result {
            Some(value) => {
                if let Some(ret) = ret {
                    self.set_slot(ret, value);
                }
                true
            }
            None => false,
        }
    }

    /// Reads the attribute `name` of the value at slot `instance` into
    /// slot `index`.
    pub fn slot_get_attribute(&mut self, instance: usize, name: &str, index: usize) -> bool {
        let target = self.get_slot(instance);
        let name = self.new_string(name);
        self.push_temp_ref(name); // name.
        let value = operators::get_attrib(self, target, name, true);
        self.pop_temp_ref(); // name.
        if self.has_error() {
            return false;
        }
        self.set_slot(index, value);
        true
    }

    /// Writes the value at slot `value` to the attribute `name` of the
    /// value at slot `instance`.
    pub fn slot_set_attribute(&mut self, instance: usize, name: &str, value: usize) -> bool {
        let target = self.get_slot(instance);
        let value = self.get_slot(value);
        let name = self.new_string(name);
        self.push_temp_ref(name); // name.
        operators::set_attrib(self, target, name, value, true);
        self.pop_temp_ref(); // name.
        !self.has_error()
    }

    /// Imports the module at `path` (separated with `/`) and places it at
    /// slot `index`.
    pub fn slot_import_module(&mut self, path: &str, index: usize) -> bool {
        match self.import_module_path(path) {
            Some(module) => {
                self.set_slot(index, module);
                true
            }
            None => false,
        }
    }

    /// Places the class of the value at slot `instance` into slot `index`.
    pub fn slot_get_class(&mut self, instance: usize, index: usize) {
        let value = self.get_slot(instance);
        let cls = operators::get_class_of(self, value);
        self.set_slot(index, Var::object(cls));
    }
}
