//! Opcode definitions and instruction decoding.
//!
//! Operands are fixed width per opcode; the only exception is
//! `PUSH_CLOSURE`, whose constant index is followed by one
//! `(is_local, index)` byte pair per captured upvalue of the target
//! function. The pairs are consumed by the dispatch loop, which knows the
//! capture count from the function object.

use crate::error::{VmError, VmResult};

/// Instructions of the Wisp VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push a constant-pool value. Operand: u16 constant index.
    PushConstant = 0x01,
    /// Push null.
    PushNull = 0x02,
    /// Push true.
    PushTrue = 0x03,
    /// Push false.
    PushFalse = 0x04,
    /// Push the receiver of the current method frame.
    PushThis = 0x05,

    /// Push a fresh list. Operand: u16 size hint.
    PushList = 0x06,
    /// Pop a value and append it to the list below it.
    ListAppend = 0x07,
    /// Push a fresh map.
    PushMap = 0x08,
    /// Pop value then key and insert into the map below them.
    MapInsert = 0x09,

    /// Push a local slot. Operand: u8 local index.
    PushLocal = 0x0A,
    /// Store the stack top into a local slot. Operand: u8 local index.
    StoreLocal = 0x0B,
    /// Push a module global. Operand: u8 global index.
    PushGlobal = 0x0C,
    /// Store the stack top into a module global. Operand: u8 global index.
    StoreGlobal = 0x0D,
    /// Push a registered builtin function. Operand: u8 builtin index.
    PushBuiltinFn = 0x0E,
    /// Push the value of an upvalue. Operand: u8 upvalue index.
    PushUpvalue = 0x0F,
    /// Store the stack top into an upvalue. Operand: u8 upvalue index.
    StoreUpvalue = 0x10,

    /// Build a closure from a constant-pool function. Operand: u16 constant
    /// index, then one (is_local, index) byte pair per upvalue.
    PushClosure = 0x11,
    /// Close upvalues over the topmost stack slot and pop it.
    CloseUpvalue = 0x12,

    /// Jump forward. Operand: u16 byte offset.
    Jump = 0x13,
    /// Jump forward when the popped value is truthy. Operand: u16 offset.
    JumpIf = 0x14,
    /// Jump forward when the popped value is falsy. Operand: u16 offset.
    JumpIfNot = 0x15,
    /// Jump backward. Operand: u16 byte offset.
    Loop = 0x16,

    /// Call the callable below the arguments. Operand: u8 argc.
    Call = 0x17,
    /// Call a method on the receiver below the arguments. Operands:
    /// u8 argc, u16 method-name constant index.
    MethodCall = 0x18,
    /// Call a super-class method. Operands: u8 argc, u16 name constant.
    SuperCall = 0x19,
    /// Return the stack top from the current frame.
    Return = 0x1A,

    /// Push an attribute of the popped value. Operand: u16 name constant.
    GetAttrib = 0x1B,
    /// Pop value then target, set the attribute. Operand: u16 name
    /// constant.
    SetAttrib = 0x1C,
    /// Pop key then target, push `target[key]`.
    GetSubscript = 0x1D,
    /// Pop value, key, target; perform `target[key] = value`.
    SetSubscript = 0x1E,

    /// Arithmetic negate.
    Negative = 0x1F,
    /// Logical not.
    Not = 0x20,

    Add = 0x21,
    Subtract = 0x22,
    Multiply = 0x23,
    Divide = 0x24,
    Modulo = 0x25,

    Equal = 0x26,
    NotEqual = 0x27,
    Greater = 0x28,
    Lesser = 0x29,

    /// Pop `to` then `from`, push a Range.
    Range = 0x2A,
    /// Pop container then element, push membership.
    In = 0x2B,
    /// Pop class then value, push `value is class`.
    Is = 0x2C,

    /// Import a module by name. Operand: u16 name constant index.
    Import = 0x2D,

    /// Advance the iterator below the stack top. With a next element, push
    /// it and fall through; when exhausted, pop the sequence and iterator
    /// and jump forward. Operand: u16 exit offset.
    Iterate = 0x2E,

    /// Discard the stack top.
    Pop = 0x2F,
}

impl OpCode {
    /// The fixed operand width in bytes. `PushClosure` additionally carries
    /// its capture pairs.
    pub fn operand_size(self) -> usize {
        use OpCode::*;
        match self {
            PushConstant | PushList | PushClosure | Jump | JumpIf | JumpIfNot | Loop
            | GetAttrib | SetAttrib | Import | Iterate => 2,
            PushLocal | StoreLocal | PushGlobal | StoreGlobal | PushBuiltinFn | PushUpvalue
            | StoreUpvalue | Call => 1,
            MethodCall | SuperCall => 3,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(byte: u8) -> VmResult<Self> {
        use OpCode::*;
        Ok(match byte {
            0x01 => PushConstant,
            0x02 => PushNull,
            0x03 => PushTrue,
            0x04 => PushFalse,
            0x05 => PushThis,
            0x06 => PushList,
            0x07 => ListAppend,
            0x08 => PushMap,
            0x09 => MapInsert,
            0x0A => PushLocal,
            0x0B => StoreLocal,
            0x0C => PushGlobal,
            0x0D => StoreGlobal,
            0x0E => PushBuiltinFn,
            0x0F => PushUpvalue,
            0x10 => StoreUpvalue,
            0x11 => PushClosure,
            0x12 => CloseUpvalue,
            0x13 => Jump,
            0x14 => JumpIf,
            0x15 => JumpIfNot,
            0x16 => Loop,
            0x17 => Call,
            0x18 => MethodCall,
            0x19 => SuperCall,
            0x1A => Return,
            0x1B => GetAttrib,
            0x1C => SetAttrib,
            0x1D => GetSubscript,
            0x1E => SetSubscript,
            0x1F => Negative,
            0x20 => Not,
            0x21 => Add,
            0x22 => Subtract,
            0x23 => Multiply,
            0x24 => Divide,
            0x25 => Modulo,
            0x26 => Equal,
            0x27 => NotEqual,
            0x28 => Greater,
            0x29 => Lesser,
            0x2A => Range,
            0x2B => In,
            0x2C => Is,
            0x2D => Import,
            0x2E => Iterate,
            0x2F => Pop,
            _ => {
                return Err(VmError::invalid_bytecode(format!(
                    "Invalid opcode: {byte:#04x}"
                )))
            }
        })
    }
}

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Byte offset of the instruction in its opcode stream.
    pub offset: usize,
    pub opcode: OpCode,
    /// The fixed-width operand bytes.
    pub operand: Vec<u8>,
}

impl Instruction {
    /// Decodes the instruction at `offset`, bounds checked.
    pub fn decode(opcodes: &[u8], offset: usize) -> VmResult<Self> {
        let byte = *opcodes
            .get(offset)
            .ok_or_else(|| VmError::invalid_bytecode("Offset out of bounds"))?;
        let opcode = OpCode::try_from(byte)?;

        let operand_end = offset + 1 + opcode.operand_size();
        if operand_end > opcodes.len() {
            return Err(VmError::invalid_bytecode(format!(
                "Operand exceeds stream bounds for opcode {opcode:?}"
            )));
        }

        Ok(Self {
            offset,
            opcode,
            operand: opcodes[offset + 1..operand_end].to_vec(),
        })
    }

    /// Total encoded size, excluding any capture-pair tail.
    pub fn size(&self) -> usize {
        1 + self.opcode.operand_size()
    }

    /// The operand as a little-endian u16.
    pub fn operand_u16(&self) -> u16 {
        debug_assert!(self.operand.len() >= 2);
        u16::from_le_bytes([self.operand[0], self.operand[1]])
    }

    /// The operand as a single byte.
    pub fn operand_u8(&self) -> u8 {
        debug_assert!(!self.operand.is_empty());
        self.operand[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_opcodes() {
        for byte in 0x01..=0x2Fu8 {
            let opcode = OpCode::try_from(byte).expect("every listed byte decodes");
            assert_eq!(opcode as u8, byte);
        }
        assert!(OpCode::try_from(0x00).is_err());
        assert!(OpCode::try_from(0xFF).is_err());
    }

    #[test]
    fn test_decode_bounds() {
        let stream = [OpCode::PushConstant as u8, 0x05];
        assert!(Instruction::decode(&stream, 0).is_err());

        let stream = [OpCode::PushConstant as u8, 0x05, 0x00];
        let instr = Instruction::decode(&stream, 0).expect("decode should succeed");
        assert_eq!(instr.opcode, OpCode::PushConstant);
        assert_eq!(instr.operand_u16(), 5);
        assert_eq!(instr.size(), 3);
    }
}
