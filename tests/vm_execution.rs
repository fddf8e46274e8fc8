//! End-to-end bytecode execution tests.

mod common;

use wisp_vm::{BytecodeBuilder, OpCode, RunResult, Var, Vm};

/// Builds a module rooted by a handle, runs `build` against its implicit
/// main, executes it and returns the outcome with the module handle
/// released.
fn run_main(vm: &mut Vm, build: impl FnOnce(&mut BytecodeBuilder<'_>)) -> RunResult {
    let module = vm.new_module();
    let handle = vm.new_handle(Var::object(module));

    let mut builder = BytecodeBuilder::main(vm, module);
    build(&mut builder);

    let result = vm.run_module(module);
    vm.release_handle(handle);
    result
}

/// Builds a zero-argument function in a fresh module and calls it,
/// returning its result.
fn call_built(vm: &mut Vm, build: impl FnOnce(&mut BytecodeBuilder<'_>)) -> Var {
    let module = vm.new_module();
    let handle = vm.new_handle(Var::object(module));

    let function = {
        let mut builder = BytecodeBuilder::function(vm, module, "test_fn", 0);
        build(&mut builder);
        builder.function_ref()
    };
    let closure = vm.new_closure(function);
    let result = vm
        .call_function(closure, &[])
        .expect("the built function should not error");

    vm.release_handle(handle);
    result
}

#[test]
fn test_print_addition_writes_stdout() {
    let (mut vm, stdout, _) = common::capture_vm();

    let print = vm.find_builtin_fn("print").expect("print is a core builtin").0 as u8;
    let result = run_main(&mut vm, |b| {
        b.op_u8(OpCode::PushBuiltinFn, print);
        b.push_number(1.0);
        b.push_number(2.0);
        b.op(OpCode::Add);
        b.op_u8(OpCode::Call, 1);
        b.op(OpCode::Pop);
        b.finish();
    });

    assert_eq!(result, RunResult::Success);
    assert_eq!(stdout.borrow().as_str(), "3\n");
}

#[test]
fn test_run_string_through_compiler_hook() {
    let (mut vm, stdout, _) = common::capture_vm_with(|config| {
        config.compile_fn = Some(common::stub_compile);
    });

    let result = vm.run_string("print(1 + 2)");
    assert_eq!(result, RunResult::Success);
    assert_eq!(stdout.borrow().as_str(), "3\n");
}

#[test]
fn test_arithmetic() {
    let (mut vm, _, _) = common::capture_vm();

    // (10 - 2) * 3 / 4 == 6
    let result = call_built(&mut vm, |b| {
        b.push_number(10.0);
        b.push_number(2.0);
        b.op(OpCode::Subtract);
        b.push_number(3.0);
        b.op(OpCode::Multiply);
        b.push_number(4.0);
        b.op(OpCode::Divide);
        b.ret();
    });
    assert_eq!(result, Var::number(6.0));

    // 7 % 3 == 1
    let result = call_built(&mut vm, |b| {
        b.push_number(7.0);
        b.push_number(3.0);
        b.op(OpCode::Modulo);
        b.ret();
    });
    assert_eq!(result, Var::number(1.0));
}

#[test]
fn test_comparisons_and_branches() {
    let (mut vm, _, _) = common::capture_vm();

    // max(3, 9): pushes both, keeps the greater via a conditional jump.
    let result = call_built(&mut vm, |b| {
        b.push_number(3.0);
        b.push_number(9.0);
        b.op(OpCode::Greater);
        let else_jump = b.jump_placeholder(OpCode::JumpIf);
        b.push_number(9.0);
        b.ret();
        b.patch_jump(else_jump);
        b.push_number(3.0);
        b.ret();
    });
    assert_eq!(result, Var::number(9.0));
}

#[test]
fn test_loop_over_range() {
    let (mut vm, _, _) = common::capture_vm();

    // sum = 0; for i in 1..4: sum = sum + i; return sum
    let result = call_built(&mut vm, |b| {
        b.stack_size(8);
        b.push_number(0.0); // local 0: sum
        b.push_number(1.0);
        b.push_number(4.0);
        b.op(OpCode::Range); // the sequence
        b.op(OpCode::PushNull); // the iterator
        let loop_start = b.offset();
        let exit = b.jump_placeholder(OpCode::Iterate);
        b.op_u8(OpCode::PushLocal, 0);
        b.op(OpCode::Add);
        b.op_u8(OpCode::StoreLocal, 0);
        b.op(OpCode::Pop);
        b.loop_to(loop_start);
        b.patch_jump(exit);
        b.op_u8(OpCode::PushLocal, 0);
        b.ret();
    });
    assert_eq!(result, Var::number(6.0));
}

#[test]
fn test_list_insert_negative_index_appends() {
    let (mut vm, _, _) = common::capture_vm();

    // [1, 2, 3].insert(-1, 4) yields [1, 2, 3, 4].
    let result = call_built(&mut vm, |b| {
        b.op_u16(OpCode::PushList, 3);
        for n in [1.0, 2.0, 3.0] {
            b.push_number(n);
            b.op(OpCode::ListAppend);
        }
        b.push_number(-1.0);
        b.push_number(4.0);
        b.method_call("insert", 2);
        b.ret();
    });

    assert!(result.is_obj());
    let elements = vm.heap().list(result.as_obj()).as_slice().to_vec();
    assert_eq!(elements.len(), 4);
    assert_eq!(elements[3], Var::number(4.0));
}

#[test]
fn test_string_split() {
    let (mut vm, _, _) = common::capture_vm();

    let result = call_built(&mut vm, |b| {
        b.push_string("a,b,,c");
        b.push_string(",");
        b.method_call("split", 1);
        b.ret();
    });

    assert!(result.is_obj());
    let parts: Vec<String> = vm
        .heap()
        .list(result.as_obj())
        .as_slice()
        .iter()
        .map(|part| vm.heap().string(part.as_obj()).as_str().to_string())
        .collect();
    assert_eq!(parts, ["a", "b", "", "c"]);
}

#[test]
fn test_string_replace_with_count() {
    let (mut vm, _, _) = common::capture_vm();

    let result = call_built(&mut vm, |b| {
        b.push_string("hello");
        b.push_string("l");
        b.push_string("L");
        b.push_number(1.0);
        b.method_call("replace", 3);
        b.ret();
    });
    assert_eq!(vm.heap().string(result.as_obj()).as_str(), "heLlo");

    let result = call_built(&mut vm, |b| {
        b.push_string("hello");
        b.push_string("l");
        b.push_string("L");
        b.push_number(-1.0);
        b.method_call("replace", 3);
        b.ret();
    });
    assert_eq!(vm.heap().string(result.as_obj()).as_str(), "heLLo");
}

#[test]
fn test_map_literal_and_subscript() {
    let (mut vm, _, _) = common::capture_vm();

    // {"x": 42}["x"] == 42
    let result = call_built(&mut vm, |b| {
        b.op(OpCode::PushMap);
        b.push_string("x");
        b.push_number(42.0);
        b.op(OpCode::MapInsert);
        b.push_string("x");
        b.op(OpCode::GetSubscript);
        b.ret();
    });
    assert_eq!(result, Var::number(42.0));
}

#[test]
fn test_membership_and_type_checks() {
    let (mut vm, _, _) = common::capture_vm();

    // "ell" in "hello"
    let result = call_built(&mut vm, |b| {
        b.push_string("ell");
        b.push_string("hello");
        b.op(OpCode::In);
        b.ret();
    });
    assert_eq!(result, Var::TRUE);

    // 42 is Number
    let number_cls = vm.builtin_class(wisp_vm::VarKind::Number);
    let result = call_built(&mut vm, |b| {
        b.push_number(42.0);
        let cls = b.constant(Var::object(number_cls));
        b.op_u16(OpCode::PushConstant, cls);
        b.op(OpCode::Is);
        b.ret();
    });
    assert_eq!(result, Var::TRUE);
}

#[test]
fn test_closure_counter_captures_upvalue() {
    let (mut vm, _, _) = common::capture_vm();

    let module = vm.new_module();
    let handle = vm.new_handle(Var::object(module));

    // inner: count = count + 1; return count  (count is upvalue 0)
    let inner = {
        let mut b = BytecodeBuilder::function(&mut vm, module, "inner", 0);
        b.upvalue_count(1);
        b.op_u8(OpCode::PushUpvalue, 0);
        b.push_number(1.0);
        b.op(OpCode::Add);
        b.op_u8(OpCode::StoreUpvalue, 0);
        b.ret();
        b.function_ref()
    };

    // outer: count = 0; return fn captured over count
    let outer = {
        let mut b = BytecodeBuilder::function(&mut vm, module, "outer", 0);
        b.stack_size(4);
        b.push_number(0.0); // local 0: count
        let inner_const = b.constant(Var::object(inner));
        b.op_u16(OpCode::PushClosure, inner_const);
        b.raw_byte(1); // capture a local
        b.raw_byte(0); // local index 0
        b.ret();
        b.function_ref()
    };

    let outer_closure = vm.new_closure(outer);
    let counter = vm
        .call_function(outer_closure, &[])
        .expect("outer should return the counter closure");
    assert!(counter.is_obj());
    let counter_handle = vm.new_handle(counter);

    // The upvalue closed over `count` when outer returned; each call
    // increments the closed cell.
    for expected in [1.0, 2.0, 3.0] {
        let result = vm
            .call_function(counter.as_obj(), &[])
            .expect("counter calls should succeed");
        assert_eq!(result, Var::number(expected));
    }

    vm.release_handle(counter_handle);
    vm.release_handle(handle);
}

#[test]
fn test_type_error_is_a_runtime_error() {
    let (mut vm, _, stderr) = common::capture_vm();

    let result = run_main(&mut vm, |b| {
        b.push_number(1.0);
        b.push_string("str");
        b.op(OpCode::Add);
        b.op(OpCode::Pop);
        b.finish();
    });

    assert_eq!(result, RunResult::RuntimeError);
    assert!(stderr.borrow().contains("Unsupported operand types"));
}

#[test]
fn test_undefined_attribute_errors() {
    let (mut vm, _, stderr) = common::capture_vm();

    let result = run_main(&mut vm, |b| {
        b.push_number(1.0);
        let name = b.name_constant("missing");
        b.op_u16(OpCode::GetAttrib, name);
        b.op(OpCode::Pop);
        b.finish();
    });

    assert_eq!(result, RunResult::RuntimeError);
    assert!(stderr.borrow().contains("has no attribute named 'missing'"));
}

#[test]
fn test_repl_buffers_incomplete_input() {
    let (mut vm, stdout, _) = common::capture_vm_with(|config| {
        config.compile_fn = Some(common::stub_compile);
    });

    common::push_stdin(&vm, "print(7)");
    let result = vm.run_repl();

    assert_eq!(result, RunResult::Success);
    let output = stdout.borrow();
    assert!(output.contains(">>> "));
    assert!(output.contains("7\n"));
}

#[test]
fn test_repl_unexpected_eof_asks_for_more() {
    let (mut vm, stdout, _) = common::capture_vm_with(|config| {
        config.compile_fn = Some(common::stub_compile);
    });

    // "if (" is incomplete; the REPL shows the continuation prompt.
    common::push_stdin(&vm, "if (");
    let result = vm.run_repl();

    assert_eq!(result, RunResult::Success);
    assert!(stdout.borrow().contains("... "));
}
