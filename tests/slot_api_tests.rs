//! Tests for the slot API: validators, setters, calls and native class
//! lifecycles driven from host code.

mod common;

use wisp_vm::{Var, VarKind, Vm};

#[test]
fn test_reserve_and_set_slots() {
    let (mut vm, _, _) = common::capture_vm();

    vm.reserve_slots(6);
    assert!(vm.slots_count() >= 6);

    vm.set_slot_null(0);
    vm.set_slot_bool(1, true);
    vm.set_slot_number(2, 3.5);
    vm.set_slot_string(3, "hello");
    vm.slot_new_list(4);
    vm.slot_new_range(5, 1.0, 4.0);

    assert_eq!(vm.slot_kind(0), VarKind::Null);
    assert_eq!(vm.slot_kind(1), VarKind::Bool);
    assert_eq!(vm.slot_kind(2), VarKind::Number);
    assert_eq!(vm.slot_kind(3), VarKind::String);
    assert_eq!(vm.slot_kind(4), VarKind::List);
    assert_eq!(vm.slot_kind(5), VarKind::Range);

    assert!(vm.get_slot_bool(1));
    assert_eq!(vm.get_slot_number(2), 3.5);
    assert_eq!(vm.get_slot_string(3), "hello");
}

#[test]
fn test_validators_set_runtime_errors() {
    // Validators leave an error on the fiber; use one VM per mismatch.
    let (mut vm, _, _) = common::capture_vm();
    vm.reserve_slots(2);
    vm.set_slot_string(1, "not a number");
    assert!(vm.validate_slot_number(1).is_none());
    assert!(vm.error_message().expect("validator sets an error").contains("must be a Number"));

    let (mut vm, _, _) = common::capture_vm();
    vm.reserve_slots(2);
    vm.set_slot_number(1, 1.5);
    assert!(vm.validate_slot_integer(1).is_none());
    assert!(vm.error_message().expect("validator sets an error").contains("integer"));

    let (mut vm, _, _) = common::capture_vm();
    vm.reserve_slots(2);
    vm.set_slot_number(1, 4.0);
    assert_eq!(vm.validate_slot_integer(1), Some(4));
    assert_eq!(vm.validate_slot_number(1), Some(4.0));
    assert!(vm.error_message().is_none());
}

#[test]
fn test_slot_hash_agrees_for_equal_values() {
    let (mut vm, _, _) = common::capture_vm();

    vm.reserve_slots(3);
    vm.set_slot_string(1, "same");
    vm.set_slot_string(2, "same");
    assert_eq!(vm.get_slot_hash(1), vm.get_slot_hash(2));

    vm.set_slot_number(1, 0.0);
    vm.set_slot_number(2, -0.0);
    assert_eq!(vm.get_slot_hash(1), vm.get_slot_hash(2));
}

fn native_add(vm: &mut Vm) {
    let Some(a) = vm.validate_slot_number(1) else { return };
    let Some(b) = vm.validate_slot_number(2) else { return };
    vm.set_slot_number(0, a + b);
}

#[test]
fn test_call_registered_builtin_through_slots() {
    let (mut vm, _, _) = common::capture_vm();
    vm.register_builtin_fn("add2", native_add, 2, Some("add2(a, b) Adds two numbers."));

    let (_, closure) = vm.find_builtin_fn("add2").expect("just registered");

    vm.reserve_slots(4);
    vm.set_slot(1, Var::object(closure));
    vm.set_slot_number(2, 40.0);
    vm.set_slot_number(3, 2.0);
    assert!(vm.slot_call_function(1, 2, 2, Some(0)));
    assert_eq!(vm.get_slot_number(0), 42.0);
}

#[test]
fn test_call_function_arity_mismatch() {
    let (mut vm, _, _) = common::capture_vm();
    vm.register_builtin_fn("add2", native_add, 2, None);
    let (_, closure) = vm.find_builtin_fn("add2").expect("just registered");

    vm.reserve_slots(3);
    vm.set_slot(1, Var::object(closure));
    vm.set_slot_number(2, 1.0);
    assert!(!vm.slot_call_function(1, 1, 2, Some(0)));
    assert!(vm
        .error_message()
        .expect("arity mismatch is a runtime error")
        .contains("expected exactly 2 argument(s)"));
}

#[test]
fn test_list_helpers() {
    let (mut vm, _, _) = common::capture_vm();

    vm.reserve_slots(4);
    vm.slot_new_list(1);
    vm.set_slot_number(2, 10.0);

    // Insert at -1 appends.
    assert!(vm.slot_list_insert(1, -1, 2));
    vm.set_slot_number(2, 20.0);
    assert!(vm.slot_list_insert(1, -1, 2));
    assert_eq!(vm.slot_list_length(1), 2);

    assert!(vm.slot_list_pop(1, 0, Some(3)));
    assert_eq!(vm.get_slot_number(3), 10.0);
    assert_eq!(vm.slot_list_length(1), 1);

    // Out of bounds reports an error.
    assert!(!vm.slot_list_insert(1, 5, 2));
}

#[test]
fn test_attributes_on_instances() {
    let (mut vm, _, _) = common::capture_vm();

    let module = vm.new_module();
    let module_handle = vm.new_handle(Var::object(module));
    let object_cls = vm.builtin_class(VarKind::Object);
    let cls = vm.new_class("Point", Some(object_cls), Some(module), None);
    let instance = vm.new_instance_of(cls);
    let instance_handle = vm.new_handle(Var::object(instance));

    vm.reserve_slots(3);
    vm.set_slot(1, Var::object(instance));
    vm.set_slot_number(2, 7.0);
    assert!(vm.slot_set_attribute(1, "x", 2));
    assert!(vm.slot_get_attribute(1, "x", 0));
    assert_eq!(vm.get_slot_number(0), 7.0);

    // The class of the instance is reachable through the slot API too.
    vm.slot_get_class(1, 0);
    assert_eq!(vm.get_slot(0), Var::object(cls));

    // instance_of checks walk the super chain.
    vm.set_slot(2, Var::object(object_cls));
    assert_eq!(vm.is_slot_instance_of(1, 2), Some(true));
    assert!(vm.validate_slot_instance_of(1, 2));

    vm.release_handle(instance_handle);
    vm.release_handle(module_handle);
}

fn payload_new(_vm: &mut Vm) -> Option<Box<dyn std::any::Any>> {
    Some(Box::new(String::from("native state")))
}

fn payload_delete(_vm: &mut Vm, _payload: Box<dyn std::any::Any>) {}

#[test]
fn test_native_instance_payload_through_slots() {
    let (mut vm, _, _) = common::capture_vm();

    let module = vm.new_module();
    let module_handle = vm.new_handle(Var::object(module));
    let object_cls = vm.builtin_class(VarKind::Object);
    let cls = vm.new_class("Wrapped", Some(object_cls), Some(module), None);
    vm.class_set_native(cls, Some(payload_new), Some(payload_delete));

    vm.reserve_slots(2);
    vm.set_slot(1, Var::object(cls));
    assert!(vm.slot_new_instance(1, 0, 0, 0));
    assert_eq!(vm.slot_kind(0), VarKind::Instance);

    let payload = vm
        .get_slot_native_instance(0)
        .downcast_ref::<String>()
        .expect("the payload we created");
    assert_eq!(payload, "native state");

    vm.release_handle(module_handle);
}

#[test]
fn test_handles_across_calls() {
    let (mut vm, _, _) = common::capture_vm();

    vm.reserve_slots(2);
    vm.set_slot_string(1, "captured");
    let handle = vm.get_slot_handle(1);

    // Overwrite the slot; the handle still pins the original string.
    vm.set_slot_null(1);
    vm.collect_garbage();

    vm.set_slot_handle(1, &handle);
    assert_eq!(vm.get_slot_string(1), "captured");
    vm.release_handle(handle);
}

#[test]
fn test_import_module_through_slots() {
    let (mut vm, _, _) = common::capture_vm();

    // Register a native module and import it by name.
    let module = vm.new_named_module("geometry");
    vm.module_add_function(module, "area", native_add, 2, None);
    vm.register_module(module);

    vm.reserve_slots(2);
    assert!(vm.slot_import_module("geometry", 1));
    assert_eq!(vm.slot_kind(1), VarKind::Module);

    // The module's function is readable as an attribute.
    assert!(vm.slot_get_attribute(1, "area", 0));
    assert_eq!(vm.slot_kind(0), VarKind::Closure);
}
