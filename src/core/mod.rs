//! Core language initialization: builtin classes, builtin functions and
//! the methods of the builtin types.

use crate::object::Object;
use crate::runtime::operators;
use crate::value::{ObjRef, Var, VarKind};
use crate::vm::Vm;

/// Initializes the builtin class hierarchy and the core builtins on a
/// fresh VM.
pub(crate) fn initialize_core(vm: &mut Vm) {
    initialize_classes(vm);

    vm.register_builtin_fn("print", print, -1, Some("print(...) Writes values to stdout."));
    vm.register_builtin_fn("input", input, -1, Some("input([prompt]) Reads a line from stdin."));
    vm.register_builtin_fn(
        "to_string",
        to_string,
        1,
        Some("to_string(value) The string representation of the value."),
    );
    vm.register_builtin_fn(
        "repr",
        repr,
        1,
        Some("repr(value) The debug representation of the value."),
    );
    vm.register_builtin_fn(
        "yield",
        yield_,
        -1,
        Some("yield([value]) Suspends the current fiber."),
    );
    vm.register_builtin_fn(
        "assert",
        assert_,
        -1,
        Some("assert(condition [, message]) Errors when the condition is falsy."),
    );

    let string_cls = vm.builtin_class(VarKind::String);
    vm.class_add_method(string_cls, "lower", string_lower, 0, None);
    vm.class_add_method(string_cls, "upper", string_upper, 0, None);
    vm.class_add_method(string_cls, "strip", string_strip, 0, None);
    vm.class_add_method(string_cls, "replace", string_replace, -1, None);
    vm.class_add_method(string_cls, "split", string_split, 1, None);

    let list_cls = vm.builtin_class(VarKind::List);
    vm.class_add_method(list_cls, "append", list_append, 1, None);
    vm.class_add_method(list_cls, "insert", list_insert, 2, None);
    vm.class_add_method(list_cls, "pop", list_pop, -1, None);
    vm.class_add_method(list_cls, "clear", list_clear, 0, None);

    let map_cls = vm.builtin_class(VarKind::Map);
    vm.class_add_method(map_cls, "has", map_has, 1, None);
    vm.class_add_method(map_cls, "remove", map_remove, 1, None);
    vm.class_add_method(map_cls, "clear", map_clear, 0, None);

    let range_cls = vm.builtin_class(VarKind::Range);
    vm.class_add_method(range_cls, "to_list", range_to_list, 0, None);

    let fiber_cls = vm.builtin_class(VarKind::Fiber);
    vm.class_add_method(fiber_cls, "_init", fiber_init, 1, None);
    vm.class_add_method(fiber_cls, "run", fiber_run, -1, None);
    vm.class_add_method(fiber_cls, "resume", fiber_resume, -1, None);
}

fn initialize_classes(vm: &mut Vm) {
    let object_cls = vm.new_class("Object", None, None, None);
    vm.heap.class_mut(object_cls).class_of = VarKind::Object;
    vm.builtin_classes[VarKind::Object as usize] = Some(object_cls);

    let builtin = [
        (VarKind::Null, "Null"),
        (VarKind::Bool, "Bool"),
        (VarKind::Number, "Number"),
        (VarKind::String, "String"),
        (VarKind::List, "List"),
        (VarKind::Map, "Map"),
        (VarKind::Range, "Range"),
        (VarKind::Module, "Module"),
        (VarKind::Closure, "Closure"),
        (VarKind::MethodBind, "MethodBind"),
        (VarKind::Fiber, "Fiber"),
        (VarKind::Class, "Class"),
    ];
    for (kind, name) in builtin {
        let cls = vm.new_class(name, Some(object_cls), None, None);
        vm.heap.class_mut(cls).class_of = kind;
        vm.builtin_classes[kind as usize] = Some(cls);
    }
}

// Builtin functions.

fn print(vm: &mut Vm) {
    let argc = vm.arg_count();
    let mut out = String::new();
    for i in 1..=argc {
        let value = vm.get_slot(i);
        let Some(text) = operators::var_to_string(vm, value, false) else {
            return;
        };
        if i != 1 {
            out.push(' ');
        }
        out.push_str(vm.heap.string(text).as_str());
    }
    out.push('\n');
    vm.write_stdout(&out);
    vm.set_slot_null(0);
}

fn input(vm: &mut Vm) {
    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 0, 1) {
        return;
    }
    if argc == 1 {
        let value = vm.get_slot(1);
        let Some(prompt) = operators::var_to_string(vm, value, false) else {
            return;
        };
        let prompt = vm.heap.string(prompt).as_str().to_string();
        vm.write_stdout(&prompt);
    }

    let Some(read) = vm.config.stdin_read else {
        vm.set_runtime_error("No stdin read function configured.");
        return;
    };
    match read(vm) {
        Some(line) => vm.set_slot_string(0, &line),
        None => vm.set_slot_null(0),
    }
}

fn to_string(vm: &mut Vm) {
    let value = vm.get_slot(1);
    if let Some(text) = operators::var_to_string(vm, value, false) {
        vm.set_slot(0, Var::object(text));
    }
}

fn repr(vm: &mut Vm) {
    let value = vm.get_slot(1);
    if let Some(text) = operators::var_to_string(vm, value, true) {
        vm.set_slot(0, Var::object(text));
    }
}

fn yield_(vm: &mut Vm) {
    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 0, 1) {
        return;
    }
    let value = if argc == 1 { Some(vm.get_slot(1)) } else { None };

    let current = vm.fiber.expect("Natives always run on a fiber.");
    if vm.heap.fiber(current).caller.is_none() {
        vm.set_runtime_error("Can't yield from the root fiber.");
        return;
    }
    vm.yield_fiber(value);
}

fn assert_(vm: &mut Vm) {
    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 1, 2) {
        return;
    }
    if vm.get_slot_bool(1) {
        vm.set_slot_null(0);
        return;
    }

    let message = if argc == 2 {
        let value = vm.get_slot(2);
        match operators::var_to_string(vm, value, false) {
            Some(text) => format!(": {}", vm.heap.string(text).as_str()),
            None => return,
        }
    } else {
        String::new()
    };
    vm.set_runtime_error(format!("Assertion failed{message}."));
}

// String methods.

fn receiver_obj(vm: &Vm) -> ObjRef {
    let receiver = vm.receiver();
    debug_assert!(receiver.is_obj());
    receiver.as_obj()
}

fn string_lower(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let lowered = vm.string_lower(this);
    vm.set_slot(0, Var::object(lowered));
}

fn string_upper(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let uppered = vm.string_upper(this);
    vm.set_slot(0, Var::object(uppered));
}

fn string_strip(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let stripped = vm.string_strip(this);
    vm.set_slot(0, Var::object(stripped));
}

fn string_replace(vm: &mut Vm) {
    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 2, 3) {
        return;
    }
    let this = receiver_obj(vm);
    if vm.validate_slot_string(1).is_none() || vm.validate_slot_string(2).is_none() {
        return;
    }
    let count = if argc == 3 {
        match vm.validate_slot_integer(3) {
            Some(count) if count >= -1 => count,
            Some(_) => {
                vm.set_runtime_error("Replace count must be -1 or non-negative.");
                return;
            }
            None => return,
        }
    } else {
        -1
    };

    let old = vm.get_slot(1).as_obj();
    let new = vm.get_slot(2).as_obj();
    let replaced = vm.string_replace(this, old, new, count);
    vm.set_slot(0, Var::object(replaced));
}

fn string_split(vm: &mut Vm) {
    let this = receiver_obj(vm);
    if vm.validate_slot_string(1).is_none() {
        return;
    }
    let sep = vm.get_slot(1).as_obj();
    let list = vm.string_split(this, sep);
    vm.set_slot(0, Var::object(list));
}

// List methods.

fn list_append(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let value = vm.get_slot(1);
    vm.list_append(this, value);
    vm.set_slot(0, Var::object(this));
}

fn list_insert(vm: &mut Vm) {
    let Some(index) = vm.validate_slot_integer(1) else {
        return;
    };
    let this = receiver_obj(vm);
    let length = vm.heap.list(this).len() as i32;

    let index = if index < 0 { length + index + 1 } else { index };
    if index < 0 || index > length {
        vm.set_runtime_error("Index out of bounds.");
        return;
    }

    let value = vm.get_slot(2);
    vm.list_insert_at(this, index as usize, value);
    vm.set_slot(0, Var::object(this));
}

fn list_pop(vm: &mut Vm) {
    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 0, 1) {
        return;
    }
    let index = if argc == 1 {
        match vm.validate_slot_integer(1) {
            Some(index) => index,
            None => return,
        }
    } else {
        -1
    };

    let this = receiver_obj(vm);
    let length = vm.heap.list(this).len() as i32;
    let index = if index < 0 { length + index } else { index };
    if index < 0 || index >= length {
        vm.set_runtime_error("Index out of bounds.");
        return;
    }

    let popped = vm.list_remove_at(this, index as usize);
    vm.set_slot(0, popped);
}

fn list_clear(vm: &mut Vm) {
    let this = receiver_obj(vm);
    vm.list_clear(this);
    vm.set_slot_null(0);
}

// Map methods.

fn map_has(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let key = vm.get_slot(1);
    if !vm.heap.is_hashable(key) {
        let type_name = vm.heap.value_type_name(key);
        vm.set_runtime_error(format!("'{type_name}' is not hashable."));
        return;
    }
    let has = vm.heap.map_contains(this, key);
    vm.set_slot_bool(0, has);
}

fn map_remove(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let key = vm.get_slot(1);
    if !vm.heap.is_hashable(key) {
        let type_name = vm.heap.value_type_name(key);
        vm.set_runtime_error(format!("'{type_name}' is not hashable."));
        return;
    }
    let removed = vm.heap.map_remove_key(this, key);
    if removed.is_undef() {
        vm.set_slot_null(0);
    } else {
        vm.set_slot(0, removed);
    }
}

fn map_clear(vm: &mut Vm) {
    let this = receiver_obj(vm);
    vm.heap.map_clear(this);
    vm.set_slot_null(0);
}

// Range methods.

fn range_to_list(vm: &mut Vm) {
    let this = receiver_obj(vm);
    let list = vm.range_as_list(this);
    vm.set_slot(0, Var::object(list));
}

// Fiber methods. The Fiber class is builtin, so its constructor returns
// the real fiber object (pre-construction produced null).

fn fiber_init(vm: &mut Vm) {
    let value = vm.get_slot(1);
    if !value.is_obj() || !matches!(vm.heap.get(value.as_obj()), Object::Closure(_)) {
        vm.set_runtime_error("Expected a function to create a fiber.");
        return;
    }
    let fiber = vm.new_fiber(Some(value.as_obj()));
    vm.set_slot(0, Var::object(fiber));
}

fn fiber_run(vm: &mut Vm) {
    let this = receiver_obj(vm);
    debug_assert!(matches!(vm.heap.get(this), Object::Fiber(_)));

    let argc = vm.arg_count();
    let args: Vec<Var> = (1..=argc).map(|i| vm.get_slot(i)).collect();

    if !vm.prepare_fiber(this, &args) {
        return;
    }
    vm.switch_fiber(this, None);
}

fn fiber_resume(vm: &mut Vm) {
    let this = receiver_obj(vm);
    debug_assert!(matches!(vm.heap.get(this), Object::Fiber(_)));

    let argc = vm.arg_count();
    if !vm.check_argc_range(argc, 0, 1) {
        return;
    }
    let value = if argc == 1 { Some(vm.get_slot(1)) } else { None };

    if vm.heap.fiber(this).state == crate::fiber::FiberState::New {
        if !vm.prepare_fiber(this, &[]) {
            return;
        }
    }
    vm.switch_fiber(this, value);
}
