//! KBC instruction decoding
//!
//! The decoder is the single source of truth for operand extraction: the
//! interpreter's dispatch loop and the disassembling tests both go through
//! [`Instr::decode`], so the narrow and wide prologues of a format cannot
//! drift apart between handlers.

use crate::opcode::{Format, Opcode, WIDE_BIT};
use thiserror::Error;

/// Errors that can occur during bytecode decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of bytecode stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid opcode
    #[error("Invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// Wide flag on a format that has no wide form
    #[error("Opcode {0:?} at offset {1} has no wide form")]
    InvalidWideForm(Opcode, usize),
}

/// Decoded operands of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// No operands.
    None,
    /// `A` byte operand.
    A(u32),
    /// `D` unsigned operand.
    D(u32),
    /// `X` signed operand.
    X(i32),
    /// `T` jump offset, relative to the start of the instruction.
    T(i32),
    /// `A` byte + `E` unsigned operand.
    AE(u32, u32),
    /// `A` byte + `Y` signed operand.
    AY(u32, i32),
    /// `D` unsigned operand + `F` byte.
    DF(u32, u32),
    /// Three byte operands.
    ABC(u32, u32, u32),
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// The opcode.
    pub op: Opcode,
    /// Whether the wide encoding was used.
    pub wide: bool,
    /// The decoded operands.
    pub operands: Operands,
    /// Offset of the next instruction.
    pub next: usize,
}

#[inline]
fn read_u8(code: &[u8], at: usize) -> Result<u32, DecodeError> {
    code.get(at)
        .map(|b| *b as u32)
        .ok_or(DecodeError::UnexpectedEnd(at))
}

#[inline]
fn read_u32(code: &[u8], at: usize) -> Result<u32, DecodeError> {
    if at + 4 > code.len() {
        return Err(DecodeError::UnexpectedEnd(at));
    }
    Ok(u32::from_le_bytes([
        code[at],
        code[at + 1],
        code[at + 2],
        code[at + 3],
    ]))
}

impl Instr {
    /// Decode the instruction starting at `pc`.
    pub fn decode(code: &[u8], pc: usize) -> Result<Instr, DecodeError> {
        let byte = code.get(pc).copied().ok_or(DecodeError::UnexpectedEnd(pc))?;
        let wide = byte & WIDE_BIT != 0;
        let op = Opcode::from_u8(byte & !WIDE_BIT)
            .ok_or(DecodeError::InvalidOpcode(byte, pc))?;
        let format = op.format();
        if wide && !format.has_wide_form() {
            return Err(DecodeError::InvalidWideForm(op, pc));
        }

        let operands = match format {
            Format::Op0 => Operands::None,
            Format::OpA => Operands::A(read_u8(code, pc + 1)?),
            Format::OpD => Operands::D(if wide {
                read_u32(code, pc + 1)?
            } else {
                read_u8(code, pc + 1)?
            }),
            Format::OpX => Operands::X(if wide {
                read_u32(code, pc + 1)? as i32
            } else {
                read_u8(code, pc + 1)? as u8 as i8 as i32
            }),
            Format::OpT => Operands::T(if wide {
                read_u32(code, pc + 1)? as i32
            } else {
                read_u8(code, pc + 1)? as u8 as i8 as i32
            }),
            Format::OpAE => {
                let a = read_u8(code, pc + 1)?;
                let e = if wide {
                    read_u32(code, pc + 2)?
                } else {
                    read_u8(code, pc + 2)?
                };
                Operands::AE(a, e)
            }
            Format::OpAY => {
                let a = read_u8(code, pc + 1)?;
                let y = if wide {
                    read_u32(code, pc + 2)? as i32
                } else {
                    read_u8(code, pc + 2)? as u8 as i8 as i32
                };
                Operands::AY(a, y)
            }
            Format::OpDF => {
                let (d, f) = if wide {
                    (read_u32(code, pc + 1)?, read_u8(code, pc + 5)?)
                } else {
                    (read_u8(code, pc + 1)?, read_u8(code, pc + 2)?)
                };
                Operands::DF(d, f)
            }
            Format::OpABC => Operands::ABC(
                read_u8(code, pc + 1)?,
                read_u8(code, pc + 2)?,
                read_u8(code, pc + 3)?,
            ),
        };

        let width = if wide {
            format.wide_width()
        } else {
            format.narrow_width()
        };
        Ok(Instr {
            op,
            wide,
            operands,
            next: pc + width,
        })
    }

    /// `A` operand.
    pub fn a(&self) -> u32 {
        match self.operands {
            Operands::A(a) | Operands::AE(a, _) | Operands::AY(a, _) | Operands::ABC(a, _, _) => a,
            _ => panic!("instruction {:?} has no A operand", self.op),
        }
    }

    /// `B` operand.
    pub fn b(&self) -> u32 {
        match self.operands {
            Operands::ABC(_, b, _) => b,
            _ => panic!("instruction {:?} has no B operand", self.op),
        }
    }

    /// `C` operand.
    pub fn c(&self) -> u32 {
        match self.operands {
            Operands::ABC(_, _, c) => c,
            _ => panic!("instruction {:?} has no C operand", self.op),
        }
    }

    /// `D` operand.
    pub fn d(&self) -> u32 {
        match self.operands {
            Operands::D(d) | Operands::DF(d, _) => d,
            _ => panic!("instruction {:?} has no D operand", self.op),
        }
    }

    /// `E` operand.
    pub fn e(&self) -> u32 {
        match self.operands {
            Operands::AE(_, e) => e,
            _ => panic!("instruction {:?} has no E operand", self.op),
        }
    }

    /// `F` operand.
    pub fn f(&self) -> u32 {
        match self.operands {
            Operands::DF(_, f) => f,
            _ => panic!("instruction {:?} has no F operand", self.op),
        }
    }

    /// `X` operand.
    pub fn x(&self) -> i32 {
        match self.operands {
            Operands::X(x) => x,
            _ => panic!("instruction {:?} has no X operand", self.op),
        }
    }

    /// `Y` operand.
    pub fn y(&self) -> i32 {
        match self.operands {
            Operands::AY(_, y) => y,
            _ => panic!("instruction {:?} has no Y operand", self.op),
        }
    }

    /// `T` operand.
    pub fn t(&self) -> i32 {
        match self.operands {
            Operands::T(t) => t,
            _ => panic!("instruction {:?} has no T operand", self.op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BytecodeWriter;

    #[test]
    fn test_decode_narrow() {
        let mut w = BytecodeWriter::new();
        w.emit_d(Opcode::PushConstant, 7);
        w.emit_0(Opcode::ReturnTOS);
        let code = w.into_bytes();

        let i0 = Instr::decode(&code, 0).unwrap();
        assert_eq!(i0.op, Opcode::PushConstant);
        assert_eq!(i0.d(), 7);
        assert!(!i0.wide);
        assert_eq!(i0.next, 2);

        let i1 = Instr::decode(&code, i0.next).unwrap();
        assert_eq!(i1.op, Opcode::ReturnTOS);
        assert_eq!(i1.operands, Operands::None);
    }

    #[test]
    fn test_decode_wide() {
        let mut w = BytecodeWriter::new();
        w.emit_d(Opcode::PushConstant, 0x1234_5678);
        let code = w.into_bytes();

        let i = Instr::decode(&code, 0).unwrap();
        assert!(i.wide);
        assert_eq!(i.d(), 0x1234_5678);
        assert_eq!(i.next, 5);
    }

    #[test]
    fn test_decode_negative_x() {
        let mut w = BytecodeWriter::new();
        w.emit_x(Opcode::Push, -5);
        w.emit_x(Opcode::Push, -300);
        let code = w.into_bytes();

        let i0 = Instr::decode(&code, 0).unwrap();
        assert_eq!(i0.x(), -5);
        assert!(!i0.wide);

        let i1 = Instr::decode(&code, i0.next).unwrap();
        assert_eq!(i1.x(), -300);
        assert!(i1.wide);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Instr::decode(&[], 0), Err(DecodeError::UnexpectedEnd(0)));
        assert_eq!(
            Instr::decode(&[0x7F], 0),
            Err(DecodeError::InvalidOpcode(0x7F, 0))
        );
        // Truncated D operand.
        assert_eq!(
            Instr::decode(&[Opcode::PushConstant as u8], 0),
            Err(DecodeError::UnexpectedEnd(1))
        );
        // ReturnTOS has no wide form.
        assert_eq!(
            Instr::decode(&[Opcode::ReturnTOS as u8 | WIDE_BIT], 0),
            Err(DecodeError::InvalidWideForm(Opcode::ReturnTOS, 0))
        );
    }

    #[test]
    fn test_operand_pack_bijective() {
        // Every encodable (opcode, operands, form) pair decodes back to the
        // written value within its declared domain.
        let mut w = BytecodeWriter::new();
        w.emit_0(Opcode::AddInt);
        w.emit_a(Opcode::SetFrame, 9);
        w.emit_d(Opcode::Allocate, 200);
        w.emit_d(Opcode::Allocate, 70_000);
        w.emit_x(Opcode::PushInt, 127);
        w.emit_x(Opcode::PushInt, -128);
        w.emit_x(Opcode::PushInt, 1 << 20);
        w.emit_ae(Opcode::LoadConstant, 3, 1000);
        w.emit_ay(Opcode::MoveSpecial, 0, -42);
        w.emit_df(Opcode::DirectCall, 123_456, 4);
        w.emit_abc(Opcode::EntryOptional, 1, 2, 3);
        let code = w.into_bytes();

        let mut pc = 0;
        let mut decoded = Vec::new();
        while pc < code.len() {
            let i = Instr::decode(&code, pc).unwrap();
            pc = i.next;
            decoded.push(i);
        }
        assert_eq!(decoded.len(), 11);
        assert_eq!(decoded[1].a(), 9);
        assert_eq!(decoded[2].d(), 200);
        assert_eq!(decoded[3].d(), 70_000);
        assert_eq!(decoded[4].x(), 127);
        assert_eq!(decoded[5].x(), -128);
        assert_eq!(decoded[6].x(), 1 << 20);
        assert_eq!((decoded[7].a(), decoded[7].e()), (3, 1000));
        assert_eq!((decoded[8].a(), decoded[8].y()), (0, -42));
        assert_eq!((decoded[9].d(), decoded[9].f()), (123_456, 4));
        assert_eq!(
            (decoded[10].a(), decoded[10].b(), decoded[10].c()),
            (1, 2, 3)
        );
    }
}
