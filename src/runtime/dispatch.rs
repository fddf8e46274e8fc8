//! The bytecode dispatch loop.
//!
//! `run_fiber` executes the current fiber until it yields, finishes or
//! errors. Fiber switches performed by natives (resume/yield) change
//! `vm.fiber`; the loop notices and reloads. Runtime errors unwind the
//! erroring fiber's frames, rethrow into the caller fiber when one exists,
//! and otherwise surface through the stderr writer.

use crate::error::RunResult;
use crate::fiber::{CallFrame, FiberState};
use crate::object::{FunctionKind, MagicMethod};
use crate::op_code::OpCode;
use crate::runtime::operators;
use crate::value::{ObjRef, Var, VarKind};
use crate::vm::Vm;

/// Runs `fiber` until the next suspension point. The fiber must be new or
/// yielded.
pub(crate) fn run_fiber(vm: &mut Vm, fiber: ObjRef) -> RunResult {
    {
        let state = vm.heap.fiber(fiber).state;
        debug_assert!(
            matches!(state, FiberState::New | FiberState::Yielded),
            "Fiber isn't runnable (state: {state})."
        );
    }
    vm.heap.fiber_mut(fiber).state = FiberState::Running;
    vm.fiber = Some(fiber);

    loop {
        let Some(current) = vm.fiber else {
            // Every fiber yielded away; the last switch surfaced the value.
            return RunResult::Success;
        };

        if vm.heap.fiber(current).has_error() {
            if propagate_error(vm, current) {
                continue;
            }
            return RunResult::RuntimeError;
        }

        match vm.heap.fiber(current).state {
            FiberState::Running => {}
            // A native switched us away and back; keep executing.
            FiberState::Yielded => {
                vm.heap.fiber_mut(current).state = FiberState::Running;
            }
            FiberState::New | FiberState::Done => {
                unreachable!("Unrunnable fiber reached the dispatch loop.")
            }
        }

        // A fiber over a native closure has no frames; run the native to
        // completion. Regaining control after its native switched away
        // (resume, yield) finishes the fiber instead of re-entering.
        if vm.heap.fiber(current).frames.is_empty() {
            if let Some(closure) = vm.heap.fiber(current).closure {
                if vm.heap.fiber(current).started {
                    let retval = {
                        let fb = vm.heap.fiber(current);
                        fb.stack[fb.ret]
                    };
                    finish_fiber(vm, current, retval);
                } else {
                    run_native_fiber(vm, current, closure);
                }
                continue;
            }
            // The bare slot fiber has nothing to run.
            vm.heap.fiber_mut(current).state = FiberState::Done;
            vm.fiber = vm.heap.fiber(current).native_parent;
            return RunResult::Success;
        }

        if let Err(()) = step(vm, current) {
            continue; // Error or fiber change; the loop head sorts it out.
        }
    }
}

/// Runs the native closure of a frameless fiber.
fn run_native_fiber(vm: &mut Vm, fiber: ObjRef, closure: ObjRef) {
    let function = vm.heap.closure(closure).function;
    let native = match &vm.heap.function(function).kind {
        FunctionKind::Native(native) => *native,
        FunctionKind::Bytecode(_) => unreachable!("Frameless fiber over bytecode."),
    };

    vm.heap.fiber_mut(fiber).started = true;
    native(vm);

    // The native may have yielded away; only a still-current fiber is done.
    if vm.fiber != Some(fiber) {
        return;
    }
    // A pending error propagates at the loop head before anything finishes.
    if vm.heap.fiber(fiber).has_error() {
        return;
    }
    let retval = {
        let fb = vm.heap.fiber(fiber);
        fb.stack[fb.ret]
    };
    finish_fiber(vm, fiber, retval);
}

/// Marks `fiber` done and hands control (and the return value) to its
/// caller. Without a caller, control returns to the host (the run loop
/// exits); the return value stays in the fiber's return slot.
fn finish_fiber(vm: &mut Vm, fiber: ObjRef, retval: Var) {
    vm.heap.fiber_mut(fiber).state = FiberState::Done;

    let caller = vm.heap.fiber(fiber).caller;
    if let Some(caller) = caller {
        vm.heap.fiber_mut(fiber).caller = None;
        vm.heap.fiber_mut(caller).state = FiberState::Running;
        let ret = vm.heap.fiber(caller).ret;
        vm.heap.fiber_mut(caller).stack[ret] = retval;
        vm.fiber = Some(caller);
    } else {
        vm.fiber = None;
    }
}

/// Rethrows the error of `fiber` into its caller, or reports it. Returns
/// `true` when execution continues in another fiber of this run loop; on
/// `false` the loop exits with a runtime error (the error is already
/// rethrown into the native parent when one exists).
fn propagate_error(vm: &mut Vm, fiber: ObjRef) -> bool {
    let error = vm.heap.fiber(fiber).error;
    let caller = vm.heap.fiber(fiber).caller;
    let parent = vm.heap.fiber(fiber).native_parent;

    // The frames unwind wholesale; report before they're gone.
    if caller.is_none() && parent.is_none() {
        report_error(vm, fiber);
    }

    {
        let fb = vm.heap.fiber_mut(fiber);
        fb.state = FiberState::Done;
        fb.caller = None;
        fb.frames.clear();
    }

    if let Some(caller) = caller {
        vm.heap.fiber_mut(caller).error = error;
        vm.heap.fiber_mut(caller).state = FiberState::Running;
        vm.fiber = Some(caller);
        return true;
    }
    if let Some(parent) = parent {
        // The parent is suspended in a native call higher up the host
        // stack; it observes the error when that call returns.
        vm.heap.fiber_mut(parent).error = error;
    }
    vm.fiber = None;
    false
}

/// Writes the error message and a frame trace through the stderr callback.
fn report_error(vm: &mut Vm, fiber: ObjRef) {
    let Some(error) = vm.heap.fiber(fiber).error else {
        return;
    };
    let mut out = format!("Error: {}\n", vm.heap.string(error).as_str());

    let frames: Vec<CallFrame> = vm.heap.fiber(fiber).frames.iter().rev().copied().collect();
    for frame in frames {
        let function = vm.heap.closure(frame.closure).function;
        let function = vm.heap.function(function);
        let line = match &function.kind {
            FunctionKind::Bytecode(body) if frame.ip > 0 && frame.ip <= body.oplines.count() => {
                body.oplines[frame.ip - 1]
            }
            _ => 0,
        };
        out.push_str(&format!("  [at] {} (line {line})\n", function.name));
    }

    vm.write_stderr(&out);
}

// Stack helpers. The compiler's declared stack size bounds the slots a
// frame touches; hitting the cap anyway is a programmer error.

fn push(vm: &mut Vm, fiber: ObjRef, value: Var) {
    let fb = vm.heap.fiber_mut(fiber);
    debug_assert!(fb.sp < fb.stack.len(), "Value stack overflow.");
    fb.stack[fb.sp] = value;
    fb.sp += 1;
}

fn pop(vm: &mut Vm, fiber: ObjRef) -> Var {
    let fb = vm.heap.fiber_mut(fiber);
    debug_assert!(fb.sp > 0, "Value stack underflow.");
    fb.sp -= 1;
    fb.stack[fb.sp]
}

fn peek(vm: &Vm, fiber: ObjRef, from_top: usize) -> Var {
    let fb = vm.heap.fiber(fiber);
    fb.stack[fb.sp - 1 - from_top]
}

/// Executes one instruction of the innermost frame. `Err(())` means the
/// loop head must re-examine state (error set, frame pushed/popped, or
/// fiber switched).
fn step(vm: &mut Vm, fiber: ObjRef) -> Result<(), ()> {
    let frame = *vm
        .heap
        .fiber(fiber)
        .frames
        .last()
        .expect("Dispatch without a frame.");
    let function = vm.heap.closure(frame.closure).function;
    let owner = vm
        .heap
        .function(function)
        .owner
        .expect("Bytecode functions always have an owner module.");

    let mut ip = frame.ip;
    let op_byte = read_u8(vm, function, &mut ip);
    let op = match OpCode::try_from(op_byte) {
        Ok(op) => op,
        Err(_) => {
            vm.set_runtime_error(format!("Invalid opcode {op_byte:#04x}."));
            return Err(());
        }
    };

    macro_rules! operand_u8 {
        () => {
            read_u8(vm, function, &mut ip)
        };
    }
    macro_rules! operand_u16 {
        () => {
            read_u16(vm, function, &mut ip)
        };
    }
    macro_rules! commit_ip {
        () => {
            vm.heap.fiber_mut(fiber).frames.last_mut().unwrap().ip = ip
        };
    }
    // Errors leave dispatch; the loop head unwinds.
    macro_rules! check_error {
        ($value:expr) => {
            match $value {
                Some(value) => value,
                None => {
                    debug_assert!(vm.has_error(), "Operator failed without an error.");
                    return Err(());
                }
            }
        };
    }

    match op {
        OpCode::PushConstant => {
            let index = operand_u16!() as usize;
            commit_ip!();
            let value = vm.heap.module(owner).constants[index];
            push(vm, fiber, value);
        }

        OpCode::PushNull => {
            commit_ip!();
            push(vm, fiber, Var::NULL);
        }
        OpCode::PushTrue => {
            commit_ip!();
            push(vm, fiber, Var::TRUE);
        }
        OpCode::PushFalse => {
            commit_ip!();
            push(vm, fiber, Var::FALSE);
        }
        OpCode::PushThis => {
            commit_ip!();
            push(vm, fiber, frame.receiver);
        }

        OpCode::PushList => {
            let size = operand_u16!() as usize;
            commit_ip!();
            let list = vm.new_list(size);
            push(vm, fiber, Var::object(list));
        }
        OpCode::ListAppend => {
            commit_ip!();
            let value = pop(vm, fiber);
            let list = peek(vm, fiber, 0);
            vm.list_append(list.as_obj(), value);
        }
        OpCode::PushMap => {
            commit_ip!();
            let map = vm.new_map();
            push(vm, fiber, Var::object(map));
        }
        OpCode::MapInsert => {
            commit_ip!();
            let value = pop(vm, fiber);
            let key = pop(vm, fiber);
            let map = peek(vm, fiber, 0);
            if !vm.heap.is_hashable(key) {
                let type_name = vm.heap.value_type_name(key);
                vm.set_runtime_error(format!("'{type_name}' is not hashable."));
                return Err(());
            }
            vm.heap.map_set(map.as_obj(), key, value);
        }

        OpCode::PushLocal => {
            let index = operand_u8!() as usize;
            commit_ip!();
            let value = vm.heap.fiber(fiber).stack[frame.rbp + 1 + index];
            push(vm, fiber, value);
        }
        OpCode::StoreLocal => {
            let index = operand_u8!() as usize;
            commit_ip!();
            let value = peek(vm, fiber, 0);
            vm.heap.fiber_mut(fiber).stack[frame.rbp + 1 + index] = value;
        }

        OpCode::PushGlobal => {
            let index = operand_u8!() as usize;
            commit_ip!();
            debug_assert!(index < vm.heap.module(owner).globals.count());
            let value = vm.heap.module(owner).globals[index];
            push(vm, fiber, value);
        }
        OpCode::StoreGlobal => {
            let index = operand_u8!() as usize;
            commit_ip!();
            debug_assert!(index < vm.heap.module(owner).globals.count());
            let value = peek(vm, fiber, 0);
            vm.heap.module_mut(owner).globals[index] = value;
        }

        OpCode::PushBuiltinFn => {
            let index = operand_u8!() as usize;
            commit_ip!();
            let closure = vm.builtins[index];
            push(vm, fiber, Var::object(closure));
        }

        OpCode::PushUpvalue => {
            let index = operand_u8!() as usize;
            commit_ip!();
            let upvalue = vm.heap.closure(frame.closure).upvalues[index];
            let value = vm.read_upvalue(upvalue);
            push(vm, fiber, value);
        }
        OpCode::StoreUpvalue => {
            let index = operand_u8!() as usize;
            commit_ip!();
            let upvalue = vm.heap.closure(frame.closure).upvalues[index];
            let value = peek(vm, fiber, 0);
            vm.write_upvalue(upvalue, value);
        }

        OpCode::PushClosure => {
            let index = operand_u16!() as usize;
            let constant = vm.heap.module(owner).constants[index];
            debug_assert!(constant.is_obj());
            let function_obj = constant.as_obj();
            let capture_count = vm.heap.function(function_obj).upvalue_count as usize;

            let closure = vm.new_closure(function_obj);
            vm.push_temp_ref(closure); // closure.
            for _ in 0..capture_count {
                let is_local = read_u8(vm, function, &mut ip) != 0;
                let capture_index = read_u8(vm, function, &mut ip) as usize;
                let upvalue = if is_local {
                    vm.capture_upvalue(fiber, frame.rbp + 1 + capture_index)
                } else {
                    vm.heap.closure(frame.closure).upvalues[capture_index]
                };
                vm.heap.closure_mut(closure).upvalues.push(upvalue);
            }
            vm.pop_temp_ref(); // closure.

            commit_ip!();
            push(vm, fiber, Var::object(closure));
        }

        OpCode::Pop => {
            commit_ip!();
            pop(vm, fiber);
        }

        OpCode::CloseUpvalue => {
            commit_ip!();
            let top = vm.heap.fiber(fiber).sp - 1;
            vm.close_upvalues(fiber, top);
            pop(vm, fiber);
        }

        OpCode::Jump => {
            let offset = operand_u16!() as usize;
            ip += offset;
            commit_ip!();
        }
        OpCode::JumpIf => {
            let offset = operand_u16!() as usize;
            let value = pop(vm, fiber);
            if vm.heap.to_bool(value) {
                ip += offset;
            }
            commit_ip!();
        }
        OpCode::JumpIfNot => {
            let offset = operand_u16!() as usize;
            let value = pop(vm, fiber);
            if !vm.heap.to_bool(value) {
                ip += offset;
            }
            commit_ip!();
        }
        OpCode::Loop => {
            let offset = operand_u16!() as usize;
            ip -= offset;
            commit_ip!();
        }

        OpCode::Call => {
            let argc = operand_u8!() as usize;
            commit_ip!();
            let callable_at = vm.heap.fiber(fiber).sp - argc - 1;
            let callable = vm.heap.fiber(fiber).stack[callable_at];
            call_value(vm, fiber, callable, Var::UNDEFINED, callable_at, argc)?;
        }

        OpCode::MethodCall => {
            let argc = operand_u8!() as usize;
            let name_index = operand_u16!() as usize;
            commit_ip!();
            let name = vm
                .module_get_string_at(owner, name_index)
                .expect("Method name constants are interned strings.");
            let receiver_at = vm.heap.fiber(fiber).sp - argc - 1;
            let receiver = vm.heap.fiber(fiber).stack[receiver_at];

            match check_error!(operators::get_method(vm, receiver, name)) {
                operators::MethodLookup::Method(closure) => {
                    call_closure(vm, fiber, closure, receiver, receiver_at, argc)?;
                }
                operators::MethodLookup::Attribute(value) => {
                    call_value(vm, fiber, value, Var::UNDEFINED, receiver_at, argc)?;
                }
            }
        }

        OpCode::SuperCall => {
            let argc = operand_u8!() as usize;
            let name_index = operand_u16!() as usize;
            commit_ip!();
            let name = vm
                .module_get_string_at(owner, name_index)
                .expect("Method name constants are interned strings.");
            let receiver = frame.receiver;
            let ret_at = vm.heap.fiber(fiber).sp - argc - 1;
            let closure = check_error!(operators::get_super_method(vm, receiver, name));
            call_closure(vm, fiber, closure, receiver, ret_at, argc)?;
        }

        OpCode::Return => {
            let retval = pop(vm, fiber);
            vm.close_upvalues(fiber, frame.rbp);
            vm.heap.fiber_mut(fiber).frames.pop();

            if vm.heap.fiber(fiber).frames.is_empty() {
                {
                    let fb = vm.heap.fiber_mut(fiber);
                    fb.stack[frame.rbp] = retval;
                    fb.ret = frame.rbp;
                    fb.sp = frame.rbp + 1;
                }
                finish_fiber(vm, fiber, retval);
                return Err(()); // Reload; the loop decides who runs next.
            }

            // The return value lands in the callee's return slot; the
            // caller frame resumes with its own base.
            {
                let fb = vm.heap.fiber_mut(fiber);
                fb.stack[frame.rbp] = retval;
                fb.sp = frame.rbp + 1;
                let caller_rbp = fb.frames.last().unwrap().rbp;
                fb.ret = caller_rbp;
            }
            return Err(());
        }

        OpCode::GetAttrib => {
            let name_index = operand_u16!() as usize;
            commit_ip!();
            let name = vm
                .module_get_string_at(owner, name_index)
                .expect("Attribute name constants are interned strings.");
            let target = pop(vm, fiber);
            let value = operators::get_attrib(vm, target, name, false);
            if vm.has_error() {
                return Err(());
            }
            push(vm, fiber, value);
        }
        OpCode::SetAttrib => {
            let name_index = operand_u16!() as usize;
            commit_ip!();
            let name = vm
                .module_get_string_at(owner, name_index)
                .expect("Attribute name constants are interned strings.");
            let value = pop(vm, fiber);
            let target = pop(vm, fiber);
            operators::set_attrib(vm, target, name, value, false);
            if vm.has_error() {
                return Err(());
            }
            push(vm, fiber, value);
        }

        OpCode::GetSubscript => {
            commit_ip!();
            let key = pop(vm, fiber);
            let target = pop(vm, fiber);
            let value = check_error!(operators::get_subscript(vm, target, key));
            push(vm, fiber, value);
        }
        OpCode::SetSubscript => {
            commit_ip!();
            let value = pop(vm, fiber);
            let key = pop(vm, fiber);
            let target = pop(vm, fiber);
            check_error!(operators::set_subscript(vm, target, key, value));
            push(vm, fiber, value);
        }

        OpCode::Negative => {
            commit_ip!();
            let value = pop(vm, fiber);
            if !value.is_num() {
                let type_name = vm.heap.value_type_name(value);
                vm.set_runtime_error(format!("Cannot negate a '{type_name}'."));
                return Err(());
            }
            push(vm, fiber, Var::number(-value.as_num()));
        }
        OpCode::Not => {
            commit_ip!();
            let value = pop(vm, fiber);
            let value = !vm.heap.to_bool(value);
            push(vm, fiber, Var::bool(value));
        }

        OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide | OpCode::Modulo => {
            commit_ip!();
            let rhs = pop(vm, fiber);
            let lhs = pop(vm, fiber);
            let result = match op {
                OpCode::Add => operators::var_add(vm, lhs, rhs),
                OpCode::Subtract => operators::var_subtract(vm, lhs, rhs),
                OpCode::Multiply => operators::var_multiply(vm, lhs, rhs),
                OpCode::Divide => operators::var_divide(vm, lhs, rhs),
                OpCode::Modulo => operators::var_modulo(vm, lhs, rhs),
                _ => unreachable!(),
            };
            let result = check_error!(result);
            push(vm, fiber, result);
        }

        OpCode::Equal | OpCode::NotEqual => {
            commit_ip!();
            let rhs = pop(vm, fiber);
            let lhs = pop(vm, fiber);
            let equal = check_error!(operators::var_equals(vm, lhs, rhs));
            push(vm, fiber, Var::bool(equal == (op == OpCode::Equal)));
        }
        OpCode::Greater => {
            commit_ip!();
            let rhs = pop(vm, fiber);
            let lhs = pop(vm, fiber);
            let result = check_error!(operators::var_greater(vm, lhs, rhs));
            push(vm, fiber, Var::bool(result));
        }
        OpCode::Lesser => {
            commit_ip!();
            let rhs = pop(vm, fiber);
            let lhs = pop(vm, fiber);
            let result = check_error!(operators::var_lesser(vm, lhs, rhs));
            push(vm, fiber, Var::bool(result));
        }

        OpCode::Range => {
            commit_ip!();
            let to = pop(vm, fiber);
            let from = pop(vm, fiber);
            let range = check_error!(operators::var_op_range(vm, from, to));
            push(vm, fiber, range);
        }
        OpCode::In => {
            commit_ip!();
            let container = pop(vm, fiber);
            let element = pop(vm, fiber);
            let result = check_error!(operators::var_contains(vm, element, container));
            push(vm, fiber, Var::bool(result));
        }
        OpCode::Is => {
            commit_ip!();
            let type_ = pop(vm, fiber);
            let value = pop(vm, fiber);
            let result = check_error!(operators::var_is_type(vm, value, type_));
            push(vm, fiber, Var::bool(result));
        }

        OpCode::Import => {
            let name_index = operand_u16!() as usize;
            commit_ip!();
            let name = vm
                .module_get_string_at(owner, name_index)
                .expect("Import name constants are interned strings.");
            let from = vm.heap.module(owner).path;
            let module = vm.import_module(from, name);
            let module = check_error!(module);
            push(vm, fiber, module);
        }

        OpCode::Iterate => {
            let offset = operand_u16!() as usize;
            let iterator = pop(vm, fiber);
            let seq = peek(vm, fiber, 0);
            match operators::var_iterate(vm, seq, iterator) {
                Some((next, value)) => {
                    commit_ip!();
                    push(vm, fiber, next);
                    push(vm, fiber, value);
                }
                None => {
                    if vm.has_error() {
                        return Err(());
                    }
                    pop(vm, fiber); // The sequence.
                    ip += offset;
                    commit_ip!();
                }
            }
        }
    }

    Ok(())
}

/// Calls any callable value: closures, method binds, classes (construct)
/// and instances with `_call`. Arguments occupy `[ret_at + 1, ret_at + 1 +
/// argc)`; the result lands in `ret_at`.
fn call_value(
    vm: &mut Vm,
    fiber: ObjRef,
    callable: Var,
    receiver: Var,
    ret_at: usize,
    argc: usize,
) -> Result<(), ()> {
    if callable.is_obj() {
        let obj = callable.as_obj();
        match vm.heap.kind_of(callable) {
            VarKind::Closure => {
                return call_closure(vm, fiber, obj, receiver, ret_at, argc)
            }

            VarKind::MethodBind => {
                let (bound, method) = {
                    let bind = vm.heap.method_bind(obj);
                    (bind.receiver, bind.method)
                };
                if bound.is_undef() {
                    vm.set_runtime_error("Cannot call an unbound method bind.".to_string());
                    return Err(());
                }
                return call_closure(vm, fiber, method, bound, ret_at, argc);
            }

            VarKind::Class => {
                let args: Vec<Var> = {
                    let fb = vm.heap.fiber(fiber);
                    fb.stack[ret_at + 1..ret_at + 1 + argc].to_vec()
                };
                let instance = operators::construct_instance(vm, obj, &args);
                let Some(instance) = instance else {
                    return Err(());
                };
                let fb = vm.heap.fiber_mut(fiber);
                fb.stack[ret_at] = instance;
                fb.sp = ret_at + 1;
                return Ok(());
            }

            VarKind::Instance => {
                let cls = operators::get_class_of(vm, callable);
                if let Some(closure) = operators::get_magic_method(vm, cls, MagicMethod::Call) {
                    return call_closure(vm, fiber, closure, callable, ret_at, argc);
                }
                if vm.has_error() {
                    return Err(());
                }
            }

            _ => {}
        }
    }

    let type_name = vm.heap.value_type_name(callable);
    vm.set_runtime_error(format!("'{type_name}' is not callable."));
    Err(())
}

/// Invokes a closure with its arguments already in place on the stack.
/// Bytecode closures push a frame; natives run to completion inside a slot
/// window rooted at `ret_at`.
fn call_closure(
    vm: &mut Vm,
    fiber: ObjRef,
    closure: ObjRef,
    receiver: Var,
    ret_at: usize,
    argc: usize,
) -> Result<(), ()> {
    let function = vm.heap.closure(closure).function;
    let arity = vm.heap.function(function).arity;
    debug_assert!(arity != crate::object::function::ARITY_UNSET);

    if arity >= 0 && argc != arity as usize {
        let name = vm.heap.function(function).name.clone();
        vm.set_runtime_error(format!(
            "Function '{name}' expected exactly {arity} argument(s), got {argc}."
        ));
        return Err(());
    }

    if vm.heap.function(function).is_native() {
        let native = match &vm.heap.function(function).kind {
            FunctionKind::Native(native) => *native,
            FunctionKind::Bytecode(_) => unreachable!(),
        };

        // Natives see slot 0 at the return slot; arguments follow.
        let (saved_ret, saved_receiver) = {
            let fb = vm.heap.fiber_mut(fiber);
            let saved = (fb.ret, fb.receiver);
            fb.ret = ret_at;
            fb.sp = ret_at + 1 + argc;
            fb.stack[ret_at] = Var::NULL;
            fb.receiver = receiver;
            saved
        };

        native(vm);

        // If the native switched fibers (yield/resume), this fiber is
        // suspended inside the call: its `ret` must keep pointing at the
        // call's return slot so the resume value lands there.
        let suspended = vm.fiber != Some(fiber);
        {
            let fb = vm.heap.fiber_mut(fiber);
            fb.sp = ret_at + 1;
            fb.receiver = saved_receiver;
            if !suspended {
                fb.ret = saved_ret;
            }
        }

        if vm.has_error() || suspended {
            return Err(());
        }
        return Ok(());
    }

    // Bytecode call: grow the stack for the callee and push its frame.
    let stack_needed = ret_at + 1 + vm.heap.function(function).body().stack_size as usize;
    vm.ensure_stack_size(fiber, stack_needed);

    {
        let fb = vm.heap.fiber_mut(fiber);
        fb.frames.push(CallFrame {
            closure,
            ip: 0,
            rbp: ret_at,
            receiver,
        });
        fb.ret = ret_at;
        fb.sp = ret_at + 1 + argc;
    }
    Err(()) // Not an error: forces the loop to reload the new frame.
}

fn read_u8(vm: &Vm, function: ObjRef, ip: &mut usize) -> u8 {
    let byte = vm.heap.function(function).body().opcodes[*ip];
    *ip += 1;
    byte
}

fn read_u16(vm: &Vm, function: ObjRef, ip: &mut usize) -> u16 {
    let body = vm.heap.function(function).body();
    let value = u16::from_le_bytes([body.opcodes[*ip], body.opcodes[*ip + 1]]);
    *ip += 2;
    value
}
