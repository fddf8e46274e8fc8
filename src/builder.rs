//! Programmatic bytecode construction.
//!
//! The compiler is an external collaborator; embedders and tests build
//! `Function` objects directly through this builder instead. It appends to
//! a function's opcode stream, interns constants in the owner module and
//! patches forward jumps.

use crate::object::module::IMPLICIT_MAIN_NAME;
use crate::object::{FnBody, FunctionKind};
use crate::op_code::OpCode;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// Emits bytecode into one function of a module.
pub struct BytecodeBuilder<'vm> {
    vm: &'vm mut Vm,
    module: ObjRef,
    function: ObjRef,
    line: u32,
}

impl<'vm> BytecodeBuilder<'vm> {
    /// Creates a fresh bytecode function named `name` in `module` and
    /// builds into it.
    pub fn function(vm: &'vm mut Vm, module: ObjRef, name: &str, arity: i32) -> Self {
        let function = vm.new_function(
            name,
            Some(module),
            FunctionKind::Bytecode(FnBody::new()),
            None,
        );
        vm.heap.function_mut(function).arity = arity;
        Self {
            vm,
            module,
            function,
            line: 1,
        }
    }

    /// Builds into the module's implicit `@main` body, creating it when the
    /// module doesn't have one yet.
    pub fn main(vm: &'vm mut Vm, module: ObjRef) -> Self {
        if vm.heap.module(module).body.is_none() {
            vm.module_add_main(module);
        }
        let body = vm.heap.module(module).body.expect("Body closure was just added.");
        let function = vm.heap.closure(body).function;
        debug_assert_eq!(vm.heap.function(function).name, IMPLICIT_MAIN_NAME);
        Self {
            vm,
            module,
            function,
            line: 1,
        }
    }

    /// The function being built.
    pub fn function_ref(&self) -> ObjRef {
        self.function
    }

    /// The owner module.
    pub fn module_ref(&self) -> ObjRef {
        self.module
    }

    /// The VM, for interleaved object construction.
    pub fn vm(&mut self) -> &mut Vm {
        self.vm
    }

    /// Sets the source line recorded for subsequently emitted bytes.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Discards previously emitted bytecode, for hosts that recompile a
    /// function in place (the REPL does this with `@main`).
    pub fn reset(&mut self) -> &mut Self {
        let body = self.vm.heap.function_mut(self.function).body_mut();
        body.opcodes.clear();
        body.oplines.clear();
        self
    }

    /// Emits a raw operand byte, used for closure capture pairs.
    pub fn raw_byte(&mut self, byte: u8) -> &mut Self {
        self.emit_byte(byte);
        self
    }

    /// Declares the stack slots the function body needs.
    pub fn stack_size(&mut self, slots: u32) -> &mut Self {
        self.vm.heap.function_mut(self.function).body_mut().stack_size = slots;
        self
    }

    /// Declares the number of upvalues the function captures.
    pub fn upvalue_count(&mut self, count: u32) -> &mut Self {
        self.vm.heap.function_mut(self.function).upvalue_count = count;
        self
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        let body = self.vm.heap.function_mut(self.function).body_mut();
        let grown = body.opcodes.write(byte) + body.oplines.write(line);
        self.vm.heap.add_bytes(grown);
    }

    /// Emits an operand-less opcode.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        debug_assert_eq!(op.operand_size(), 0);
        self.emit_byte(op as u8);
        self
    }

    /// Emits an opcode with a one-byte operand.
    pub fn op_u8(&mut self, op: OpCode, operand: u8) -> &mut Self {
        debug_assert_eq!(op.operand_size(), 1);
        self.emit_byte(op as u8);
        self.emit_byte(operand);
        self
    }

    /// Emits an opcode with a two-byte operand.
    pub fn op_u16(&mut self, op: OpCode, operand: u16) -> &mut Self {
        debug_assert_eq!(op.operand_size(), 2);
        self.emit_byte(op as u8);
        let [lo, hi] = operand.to_le_bytes();
        self.emit_byte(lo);
        self.emit_byte(hi);
        self
    }

    /// Interns `value` in the module's constant pool.
    pub fn constant(&mut self, value: Var) -> u16 {
        let index = self.vm.module_add_constant(self.module, value);
        debug_assert!(index <= u16::MAX as u32, "Constant pool overflow.");
        index as u16
    }

    /// Interns a string constant and returns its pool index.
    pub fn name_constant(&mut self, name: &str) -> u16 {
        let (_, index) = self.vm.module_add_string(self.module, name);
        debug_assert!(index <= u16::MAX as u32, "Constant pool overflow.");
        index as u16
    }

    /// Emits a push of a number constant.
    pub fn push_number(&mut self, value: f64) -> &mut Self {
        let index = self.constant(Var::number(value));
        self.op_u16(OpCode::PushConstant, index)
    }

    /// Emits a push of a string constant.
    pub fn push_string(&mut self, text: &str) -> &mut Self {
        let (string, _) = self.vm.module_add_string(self.module, text);
        let index = self.constant(Var::object(string));
        self.op_u16(OpCode::PushConstant, index)
    }

    /// Emits a method call: `argc` arguments above the receiver.
    pub fn method_call(&mut self, name: &str, argc: u8) -> &mut Self {
        let name_index = self.name_constant(name);
        self.emit_byte(OpCode::MethodCall as u8);
        self.emit_byte(argc);
        let [lo, hi] = name_index.to_le_bytes();
        self.emit_byte(lo);
        self.emit_byte(hi);
        self
    }

    /// Emits a forward jump with a placeholder offset; patch it with
    /// [`Self::patch_jump`]. Returns the patch location.
    pub fn jump_placeholder(&mut self, op: OpCode) -> usize {
        debug_assert!(matches!(
            op,
            OpCode::Jump | OpCode::JumpIf | OpCode::JumpIfNot | OpCode::Iterate
        ));
        self.emit_byte(op as u8);
        let at = self.offset();
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        at
    }

    /// Patches a forward jump to land on the current offset. The offset is
    /// relative to the end of the jump's operand.
    pub fn patch_jump(&mut self, at: usize) {
        let target = self.offset();
        let distance = target - (at + 2);
        debug_assert!(distance <= u16::MAX as usize, "Jump too far.");
        let [lo, hi] = (distance as u16).to_le_bytes();
        let body = self.vm.heap.function_mut(self.function).body_mut();
        body.opcodes[at] = lo;
        body.opcodes[at + 1] = hi;
    }

    /// Emits a backward jump to `target` (an earlier offset).
    pub fn loop_to(&mut self, target: usize) -> &mut Self {
        let distance = self.offset() + 3 - target;
        debug_assert!(distance <= u16::MAX as usize, "Loop body too large.");
        self.op_u16(OpCode::Loop, distance as u16)
    }

    /// The current end of the opcode stream.
    pub fn offset(&self) -> usize {
        self.vm.heap.function(self.function).body().opcodes.count()
    }

    /// Emits a return of the stack top.
    pub fn ret(&mut self) -> &mut Self {
        self.op(OpCode::Return)
    }

    /// Emits an implicit `return null` and hands back the finished
    /// function.
    pub fn finish(&mut self) -> ObjRef {
        self.op(OpCode::PushNull);
        self.op(OpCode::Return);
        self.function
    }
}
