//! KBC assembly
//!
//! [`BytecodeWriter`] emits instructions into a binary buffer, choosing the
//! narrow form whenever the operands fit and the wide form otherwise. Forward
//! jumps go through [`Label`]s and are patched when the label is bound;
//! label jumps are always wide so patching never has to move code.

use crate::opcode::{Format, Opcode, WIDE_BIT};

/// A jump target that may be bound after the jumps referencing it.
#[derive(Debug)]
pub struct Label {
    /// Bound target offset, if known.
    position: Option<usize>,
    /// Offsets of instructions waiting for this label (instruction start).
    uses: Vec<usize>,
}

impl Label {
    /// Create an unbound label.
    pub fn new() -> Self {
        Self {
            position: None,
            uses: Vec::new(),
        }
    }
}

impl Default for Label {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode writer for encoding instructions
pub struct BytecodeWriter {
    buffer: Vec<u8>,
}

impl BytecodeWriter {
    /// Create a new bytecode writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Get the current bytecode buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the bytecode buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset (length of bytecode)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    #[inline]
    fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn emit_op(&mut self, op: Opcode, wide: bool) {
        debug_assert!(!wide || op.format().has_wide_form());
        self.emit_u8(op as u8 | if wide { WIDE_BIT } else { 0 });
    }

    fn byte_operand(value: u32) -> u8 {
        debug_assert!(value <= u8::MAX as u32, "byte operand out of range");
        value as u8
    }

    // ===== Instruction emission =====

    /// Emit an operand-less instruction.
    pub fn emit_0(&mut self, op: Opcode) {
        debug_assert_eq!(op.format(), Format::Op0);
        self.emit_op(op, false);
    }

    /// Emit an `A`-format instruction.
    pub fn emit_a(&mut self, op: Opcode, a: u32) {
        debug_assert_eq!(op.format(), Format::OpA);
        self.emit_op(op, false);
        self.emit_u8(Self::byte_operand(a));
    }

    /// Emit a `D`-format instruction.
    pub fn emit_d(&mut self, op: Opcode, d: u32) {
        debug_assert_eq!(op.format(), Format::OpD);
        if d <= u8::MAX as u32 {
            self.emit_op(op, false);
            self.emit_u8(d as u8);
        } else {
            self.emit_op(op, true);
            self.emit_u32(d);
        }
    }

    /// Emit an `X`-format instruction.
    pub fn emit_x(&mut self, op: Opcode, x: i32) {
        debug_assert_eq!(op.format(), Format::OpX);
        if (i8::MIN as i32..=i8::MAX as i32).contains(&x) {
            self.emit_op(op, false);
            self.emit_u8(x as i8 as u8);
        } else {
            self.emit_op(op, true);
            self.emit_u32(x as u32);
        }
    }

    /// Emit a `T`-format instruction with an explicit offset.
    pub fn emit_t(&mut self, op: Opcode, t: i32) {
        debug_assert_eq!(op.format(), Format::OpT);
        if (i8::MIN as i32..=i8::MAX as i32).contains(&t) {
            self.emit_op(op, false);
            self.emit_u8(t as i8 as u8);
        } else {
            self.emit_op(op, true);
            self.emit_u32(t as u32);
        }
    }

    /// Emit an `A_E`-format instruction.
    pub fn emit_ae(&mut self, op: Opcode, a: u32, e: u32) {
        debug_assert_eq!(op.format(), Format::OpAE);
        let a = Self::byte_operand(a);
        if e <= u8::MAX as u32 {
            self.emit_op(op, false);
            self.emit_u8(a);
            self.emit_u8(e as u8);
        } else {
            self.emit_op(op, true);
            self.emit_u8(a);
            self.emit_u32(e);
        }
    }

    /// Emit an `A_Y`-format instruction.
    pub fn emit_ay(&mut self, op: Opcode, a: u32, y: i32) {
        debug_assert_eq!(op.format(), Format::OpAY);
        let a = Self::byte_operand(a);
        if (i8::MIN as i32..=i8::MAX as i32).contains(&y) {
            self.emit_op(op, false);
            self.emit_u8(a);
            self.emit_u8(y as i8 as u8);
        } else {
            self.emit_op(op, true);
            self.emit_u8(a);
            self.emit_u32(y as u32);
        }
    }

    /// Emit a `D_F`-format instruction.
    pub fn emit_df(&mut self, op: Opcode, d: u32, f: u32) {
        debug_assert_eq!(op.format(), Format::OpDF);
        let f = Self::byte_operand(f);
        if d <= u8::MAX as u32 {
            self.emit_op(op, false);
            self.emit_u8(d as u8);
            self.emit_u8(f);
        } else {
            self.emit_op(op, true);
            self.emit_u32(d);
            self.emit_u8(f);
        }
    }

    /// Emit an `A_B_C`-format instruction.
    pub fn emit_abc(&mut self, op: Opcode, a: u32, b: u32, c: u32) {
        debug_assert_eq!(op.format(), Format::OpABC);
        self.emit_op(op, false);
        self.emit_u8(Self::byte_operand(a));
        self.emit_u8(Self::byte_operand(b));
        self.emit_u8(Self::byte_operand(c));
    }

    // ===== Labels =====

    /// Emit a jump to `label`. Always wide; forward references are patched
    /// when the label is bound.
    pub fn jump(&mut self, op: Opcode, label: &mut Label) {
        debug_assert_eq!(op.format(), Format::OpT);
        let at = self.offset();
        self.emit_op(op, true);
        match label.position {
            Some(target) => {
                self.emit_u32((target as i64 - at as i64) as u32);
            }
            None => {
                self.emit_u32(0);
                label.uses.push(at);
            }
        }
    }

    /// Bind `label` to the current offset and patch pending jumps.
    pub fn bind(&mut self, label: &mut Label) {
        debug_assert!(label.position.is_none(), "label bound twice");
        let target = self.offset();
        label.position = Some(target);
        for &at in &label.uses {
            let offset = (target as i64 - at as i64) as u32;
            self.buffer[at + 1..at + 5].copy_from_slice(&offset.to_le_bytes());
        }
        label.uses.clear();
    }
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Instr;

    #[test]
    fn test_narrow_wide_selection() {
        let mut w = BytecodeWriter::new();
        w.emit_d(Opcode::PushConstant, 255);
        w.emit_d(Opcode::PushConstant, 256);
        let code = w.into_bytes();
        assert_eq!(code.len(), 2 + 5);
        assert_eq!(code[0], Opcode::PushConstant as u8);
        assert_eq!(code[2], Opcode::PushConstant as u8 | WIDE_BIT);
    }

    #[test]
    fn test_forward_label() {
        let mut w = BytecodeWriter::new();
        let mut done = Label::new();
        w.jump(Opcode::JumpIfFalse, &mut done);
        w.emit_0(Opcode::AddInt);
        w.bind(&mut done);
        w.emit_0(Opcode::ReturnTOS);
        let code = w.into_bytes();

        let jump = Instr::decode(&code, 0).unwrap();
        assert_eq!(jump.op, Opcode::JumpIfFalse);
        // Jump from offset 0 to the bound position (5 bytes jump + 1 AddInt).
        assert_eq!(jump.t(), 6);
    }

    #[test]
    fn test_backward_label() {
        let mut w = BytecodeWriter::new();
        w.emit_0(Opcode::AddInt);
        let mut top = Label::new();
        w.bind(&mut top);
        w.emit_0(Opcode::Drop1);
        w.jump(Opcode::Jump, &mut top);
        let code = w.into_bytes();

        let jump = Instr::decode(&code, 2).unwrap();
        assert_eq!(jump.t(), -1);
        assert_eq!(2 + jump.t() as i64, 1);
    }
}
