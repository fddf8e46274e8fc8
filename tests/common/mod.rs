//! Shared test host: captured I/O and a canned-source compiler stub.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use wisp_vm::{BytecodeBuilder, CompileOptions, Configuration, OpCode, RunResult, Vm};

/// Captured process streams and queued stdin lines, attached as VM user
/// data so the fn-pointer callbacks can reach them.
pub struct Captured {
    pub stdout: Rc<RefCell<String>>,
    pub stderr: Rc<RefCell<String>>,
    pub stdin: Rc<RefCell<VecDeque<String>>>,
}

fn write_stdout(vm: &mut Vm, text: &str) {
    if let Some(captured) = vm.user_data().and_then(|d| d.downcast_ref::<Captured>()) {
        captured.stdout.borrow_mut().push_str(text);
    }
}

fn write_stderr(vm: &mut Vm, text: &str) {
    if let Some(captured) = vm.user_data().and_then(|d| d.downcast_ref::<Captured>()) {
        captured.stderr.borrow_mut().push_str(text);
    }
}

fn read_stdin(vm: &mut Vm) -> Option<String> {
    let captured = vm.user_data().and_then(|d| d.downcast_ref::<Captured>())?;
    let line = captured.stdin.borrow_mut().pop_front();
    line
}

/// Builds a VM with captured stdout/stderr and queued stdin.
#[allow(dead_code)]
pub fn capture_vm() -> (Vm, Rc<RefCell<String>>, Rc<RefCell<String>>) {
    capture_vm_with(|_| {})
}

/// Builds a captured VM, letting the caller adjust the configuration.
pub fn capture_vm_with(
    adjust: impl FnOnce(&mut Configuration),
) -> (Vm, Rc<RefCell<String>>, Rc<RefCell<String>>) {
    let stdout = Rc::new(RefCell::new(String::new()));
    let stderr = Rc::new(RefCell::new(String::new()));
    let stdin = Rc::new(RefCell::new(VecDeque::new()));

    let mut config = Configuration::default();
    config.stdout_write = Some(write_stdout);
    config.stderr_write = Some(write_stderr);
    config.stdin_read = Some(read_stdin);
    adjust(&mut config);

    let mut vm = Vm::new(Some(config));
    vm.set_user_data(Box::new(Captured {
        stdout: Rc::clone(&stdout),
        stderr: Rc::clone(&stderr),
        stdin: Rc::clone(&stdin),
    }));
    (vm, stdout, stderr)
}

/// Queues a line on the captured stdin.
#[allow(dead_code)]
pub fn push_stdin(vm: &Vm, line: &str) {
    let captured = vm
        .user_data()
        .and_then(|d| d.downcast_ref::<Captured>())
        .expect("capture_vm attaches the captured streams");
    captured.stdin.borrow_mut().push_back(line.to_string());
}

/// A stand-in for the external compiler: assembles the handful of sources
/// the tests use into the module's implicit main.
#[allow(dead_code)]
pub fn stub_compile(
    vm: &mut Vm,
    module: wisp_vm::ObjRef,
    source: &str,
    options: &CompileOptions,
) -> RunResult {
    let print = match vm.find_builtin_fn("print") {
        Some((index, _)) => index as u8,
        None => return RunResult::CompileError,
    };

    match source.trim() {
        "print(1 + 2)" => {
            let mut builder = BytecodeBuilder::main(vm, module);
            builder.reset();
            builder.op_u8(OpCode::PushBuiltinFn, print);
            builder.push_number(1.0);
            builder.push_number(2.0);
            builder.op(OpCode::Add);
            builder.op_u8(OpCode::Call, 1);
            builder.op(OpCode::Pop);
            builder.finish();
            RunResult::Success
        }
        "print(7)" => {
            let mut builder = BytecodeBuilder::main(vm, module);
            builder.reset();
            builder.op_u8(OpCode::PushBuiltinFn, print);
            builder.push_number(7.0);
            builder.op_u8(OpCode::Call, 1);
            builder.op(OpCode::Pop);
            builder.finish();
            RunResult::Success
        }
        // An unterminated construct: the REPL buffers and retries.
        "if (" => {
            if options.repl_mode {
                RunResult::UnexpectedEof
            } else {
                RunResult::CompileError
            }
        }
        _ => RunResult::CompileError,
    }
}
