//! Fiber lifecycle, yield/resume ordering and error rethrow tests.

mod common;

use wisp_vm::{BytecodeBuilder, FiberState, OpCode, Var, Vm};

/// Builds a zero-argument bytecode closure in a handle-rooted module and
/// returns (module handle index, closure ref kept alive by the module).
fn build_closure(
    vm: &mut Vm,
    build: impl FnOnce(&mut BytecodeBuilder<'_>),
) -> (wisp_vm::Handle, wisp_vm::ObjRef) {
    let module = vm.new_module();
    let handle = vm.new_handle(Var::object(module));

    let function = {
        let mut builder = BytecodeBuilder::function(vm, module, "fiber_body", 0);
        build(&mut builder);
        builder.function_ref()
    };
    let closure = vm.new_closure(function);
    vm.module_set_global(module, "fiber_body_closure", Var::object(closure));
    (handle, closure)
}

/// Calls `method` on a fiber object through the slot API, returning the
/// result slot. `None` when the call errored.
fn call_fiber_method(vm: &mut Vm, fiber: wisp_vm::ObjRef, method: &str) -> Option<Var> {
    vm.reserve_slots(2);
    vm.set_slot(1, Var::object(fiber));
    if vm.slot_call_method(1, method, 0, 0, Some(0)) {
        Some(vm.get_slot(0))
    } else {
        None
    }
}

#[test]
fn test_yield_values_in_order() {
    let (mut vm, _, _) = common::capture_vm();
    let yield_index = vm.find_builtin_fn("yield").expect("yield is a core builtin").0 as u8;

    // fn() { yield 1; yield 2 }
    let (handle, closure) = build_closure(&mut vm, |b| {
        for n in [1.0, 2.0] {
            b.op_u8(OpCode::PushBuiltinFn, yield_index);
            b.push_number(n);
            b.op_u8(OpCode::Call, 1);
            b.op(OpCode::Pop);
        }
        b.finish();
    });

    let fiber = vm.new_fiber(Some(closure));
    let fiber_handle = vm.new_handle(Var::object(fiber));

    assert_eq!(vm.heap().fiber(fiber).state, FiberState::New);

    let first = call_fiber_method(&mut vm, fiber, "resume").expect("first resume");
    assert_eq!(first, Var::number(1.0));
    assert_eq!(vm.heap().fiber(fiber).state, FiberState::Yielded);

    let second = call_fiber_method(&mut vm, fiber, "resume").expect("second resume");
    assert_eq!(second, Var::number(2.0));
    assert_eq!(vm.heap().fiber(fiber).state, FiberState::Yielded);

    // The third resume runs the body to completion.
    let third = call_fiber_method(&mut vm, fiber, "resume").expect("third resume");
    assert_eq!(third, Var::NULL);
    assert_eq!(vm.heap().fiber(fiber).state, FiberState::Done);

    // A finished fiber isn't resumable.
    assert!(call_fiber_method(&mut vm, fiber, "resume").is_none());
    assert!(vm.error_message().expect("error was rethrown").contains("finished"));

    vm.release_handle(fiber_handle);
    vm.release_handle(handle);
}

#[test]
fn test_resume_value_becomes_yield_result() {
    let (mut vm, _, _) = common::capture_vm();
    let yield_index = vm.find_builtin_fn("yield").expect("yield is a core builtin").0 as u8;

    // fn() { x = yield 1; yield x + 10 }
    let (handle, closure) = build_closure(&mut vm, |b| {
        b.op_u8(OpCode::PushBuiltinFn, yield_index);
        b.push_number(1.0);
        b.op_u8(OpCode::Call, 1); // Result: the resume value.
        b.push_number(10.0);
        b.op(OpCode::Add);
        b.op_u8(OpCode::PushBuiltinFn, yield_index);
        b.op_u8(OpCode::PushLocal, 0); // The sum landed in the first local slot.
        b.op_u8(OpCode::Call, 1);
        b.op(OpCode::Pop);
        b.finish();
    });

    let fiber = vm.new_fiber(Some(closure));
    let fiber_handle = vm.new_handle(Var::object(fiber));

    let first = call_fiber_method(&mut vm, fiber, "resume").expect("first resume");
    assert_eq!(first, Var::number(1.0));

    // resume(32): the suspended yield evaluates to 32, so the next yield
    // delivers 42.
    vm.reserve_slots(3);
    vm.set_slot(1, Var::object(fiber));
    vm.set_slot_number(2, 32.0);
    assert!(vm.slot_call_method(1, "resume", 1, 2, Some(0)));
    assert_eq!(vm.get_slot(0), Var::number(42.0));

    vm.release_handle(fiber_handle);
    vm.release_handle(handle);
}

#[test]
fn test_fiber_error_rethrows_into_caller() {
    let (mut vm, _, _) = common::capture_vm();

    // fn() { 1 + "boom" }
    let (handle, closure) = build_closure(&mut vm, |b| {
        b.push_number(1.0);
        b.push_string("boom");
        b.op(OpCode::Add);
        b.op(OpCode::Pop);
        b.finish();
    });

    let fiber = vm.new_fiber(Some(closure));
    let fiber_handle = vm.new_handle(Var::object(fiber));

    assert!(call_fiber_method(&mut vm, fiber, "resume").is_none());
    assert_eq!(vm.heap().fiber(fiber).state, FiberState::Done);
    assert!(vm
        .error_message()
        .expect("the child error is rethrown into the calling fiber")
        .contains("Unsupported operand types"));

    vm.release_handle(fiber_handle);
    vm.release_handle(handle);
}

#[test]
fn test_fiber_is_done_attribute() {
    let (mut vm, _, _) = common::capture_vm();

    let (handle, closure) = build_closure(&mut vm, |b| {
        b.finish();
    });

    let fiber = vm.new_fiber(Some(closure));
    let fiber_handle = vm.new_handle(Var::object(fiber));

    vm.reserve_slots(2);
    vm.set_slot(1, Var::object(fiber));
    assert!(vm.slot_get_attribute(1, "is_done", 0));
    assert_eq!(vm.get_slot(0), Var::FALSE);

    call_fiber_method(&mut vm, fiber, "resume").expect("run to completion");

    vm.set_slot(1, Var::object(fiber));
    assert!(vm.slot_get_attribute(1, "is_done", 0));
    assert_eq!(vm.get_slot(0), Var::TRUE);

    vm.release_handle(fiber_handle);
    vm.release_handle(handle);
}

#[test]
fn test_fiber_constructed_through_class_call() {
    let (mut vm, _, _) = common::capture_vm();

    let (handle, closure) = build_closure(&mut vm, |b| {
        b.push_number(5.0);
        b.ret();
    });

    // Fiber(fn) through the construct path.
    let fiber_cls = vm.builtin_class(wisp_vm::VarKind::Fiber);
    vm.reserve_slots(3);
    vm.set_slot(1, Var::object(fiber_cls));
    vm.set_slot(2, Var::object(closure));
    assert!(vm.slot_new_instance(1, 0, 1, 2));

    let fiber = vm.get_slot(0);
    assert!(fiber.is_obj());
    assert_eq!(vm.heap().fiber(fiber.as_obj()).state, FiberState::New);

    let result = call_fiber_method(&mut vm, fiber.as_obj(), "resume").expect("resume");
    assert_eq!(result, Var::number(5.0));

    vm.release_handle(handle);
}
