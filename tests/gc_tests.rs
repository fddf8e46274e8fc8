//! Garbage collection tests: root survival, cycle collection, temp
//! references, handle pinning and bounded transient allocation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use wisp_vm::{Var, Vm};

#[test]
fn test_unreachable_objects_are_freed() {
    let (mut vm, _, _) = common::capture_vm();
    let baseline = vm.heap().object_count();

    for i in 0..100 {
        vm.new_string(&format!("transient {i}"));
    }
    assert!(vm.heap().object_count() >= baseline + 100);

    vm.collect_garbage();
    assert_eq!(vm.heap().object_count(), baseline);
}

#[test]
fn test_handle_pins_object() {
    let (mut vm, _, _) = common::capture_vm();

    let pinned = vm.new_string("pinned");
    let handle = vm.new_handle(Var::object(pinned));
    let transient = vm.new_string("transient");

    vm.collect_garbage();
    assert!(vm.heap().is_live(pinned));
    assert!(!vm.heap().is_live(transient));
    assert_eq!(vm.heap().string(pinned).as_str(), "pinned");

    vm.release_handle(handle);
    vm.collect_garbage();
    assert!(!vm.heap().is_live(pinned));
}

#[test]
fn test_temp_ref_pins_object() {
    let (mut vm, _, _) = common::capture_vm();

    let pinned = vm.new_string("pinned");
    vm.push_temp_ref(pinned);
    vm.collect_garbage();
    assert!(vm.heap().is_live(pinned));

    vm.pop_temp_ref();
    vm.collect_garbage();
    assert!(!vm.heap().is_live(pinned));
}

#[test]
fn test_interior_references_survive() {
    let (mut vm, _, _) = common::capture_vm();

    let list = vm.new_list(0);
    let handle = vm.new_handle(Var::object(list));
    let element = vm.new_string("element");
    vm.list_append(list, Var::object(element));

    vm.collect_garbage();
    assert!(vm.heap().is_live(list));
    assert!(vm.heap().is_live(element));

    vm.release_handle(handle);
    vm.collect_garbage();
    assert!(!vm.heap().is_live(list));
    assert!(!vm.heap().is_live(element));
}

#[test]
fn test_self_referencing_list_is_collected() {
    let (mut vm, _, _) = common::capture_vm();
    let baseline = vm.heap().object_count();

    // A list containing itself: reference counting alone would leak this.
    let list = vm.new_list(0);
    vm.list_append(list, Var::object(list));

    vm.collect_garbage();
    assert_eq!(vm.heap().object_count(), baseline);
    assert!(!vm.heap().is_live(list));
}

#[test]
fn test_map_keys_and_values_survive() {
    let (mut vm, _, _) = common::capture_vm();

    let map = vm.new_map();
    let handle = vm.new_handle(Var::object(map));
    let key = vm.new_string("key");
    vm.push_temp_ref(key);
    let value = vm.new_string("value");
    vm.heap_mut().map_set(map, Var::object(key), Var::object(value));
    vm.pop_temp_ref();

    vm.collect_garbage();
    assert!(vm.heap().is_live(key));
    assert!(vm.heap().is_live(value));
    assert_eq!(
        vm.heap().map_get(map, Var::object(key)),
        Var::object(value)
    );

    vm.release_handle(handle);
}

#[test]
fn test_transient_allocation_is_bounded() {
    let (mut vm, _, _) = common::capture_vm();

    // Allocating many short-lived strings in a tight loop returns memory
    // to the allocator: the live estimate stays near the trigger
    // threshold instead of growing with the iteration count.
    let payload = "x".repeat(1024);
    for _ in 0..10_000 {
        vm.new_string(&payload);
    }

    // min_heap_size is 1 MiB and the fill percent 50: the estimate must
    // stay well under the ~1.5 MiB trigger plus one allocation burst.
    assert!(
        vm.heap().bytes_allocated() < 4 * 1024 * 1024,
        "heap estimate grew unbounded: {}",
        vm.heap().bytes_allocated()
    );
}

static DELETED: AtomicUsize = AtomicUsize::new(0);

fn counted_new(_vm: &mut Vm) -> Option<Box<dyn std::any::Any>> {
    Some(Box::new(42u32))
}

fn counted_delete(_vm: &mut Vm, payload: Box<dyn std::any::Any>) {
    assert_eq!(*payload.downcast_ref::<u32>().expect("the payload we created"), 42);
    DELETED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_instance_payload_deleted_once_on_sweep() {
    DELETED.store(0, Ordering::SeqCst);
    let (mut vm, _, _) = common::capture_vm();

    let module = vm.new_module();
    let module_handle = vm.new_handle(Var::object(module));
    let object_cls = vm.builtin_class(wisp_vm::VarKind::Object);

    // The native hooks live on the base class; the subclass inherits them
    // through the super-chain walk.
    let base = vm.new_class("NativeBase", Some(object_cls), Some(module), None);
    vm.class_set_native(base, Some(counted_new), Some(counted_delete));
    let derived = vm.new_class("NativeDerived", Some(base), Some(module), None);

    let instance = vm.new_instance_of(derived);
    assert!(vm.heap().instance(instance).native.is_some());

    // Unreachable: the sweep runs the nearest ancestor delete hook once.
    vm.collect_garbage();
    assert!(!vm.heap().is_live(instance));
    assert_eq!(DELETED.load(Ordering::SeqCst), 1);

    vm.release_handle(module_handle);
}

#[test]
fn test_closed_upvalue_keeps_value_alive() {
    let (mut vm, _, _) = common::capture_vm();

    use wisp_vm::{BytecodeBuilder, OpCode};

    let module = vm.new_module();
    let handle = vm.new_handle(Var::object(module));

    // outer: captured = "kept"; return fn() { return captured }
    let inner = {
        let mut b = BytecodeBuilder::function(&mut vm, module, "inner", 0);
        b.upvalue_count(1);
        b.op_u8(OpCode::PushUpvalue, 0);
        b.ret();
        b.function_ref()
    };
    let outer = {
        let mut b = BytecodeBuilder::function(&mut vm, module, "outer", 0);
        b.stack_size(4);
        b.push_string("kept");
        let inner_const = b.constant(Var::object(inner));
        b.op_u16(OpCode::PushClosure, inner_const);
        b.raw_byte(1);
        b.raw_byte(0);
        b.ret();
        b.function_ref()
    };

    let outer_closure = vm.new_closure(outer);
    let getter = vm
        .call_function(outer_closure, &[])
        .expect("outer returns the getter closure");
    let getter_handle = vm.new_handle(getter);

    vm.collect_garbage();

    let kept = vm
        .call_function(getter.as_obj(), &[])
        .expect("the closed upvalue still holds the string");
    assert_eq!(vm.heap().string(kept.as_obj()).as_str(), "kept");

    vm.release_handle(getter_handle);
    vm.release_handle(handle);
}
