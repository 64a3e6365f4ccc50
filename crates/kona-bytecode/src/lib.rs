//! Kona VM Bytecode Definitions
//!
//! This crate provides the KBC instruction set: opcode enumeration, operand
//! format table, instruction decoder, and a small assembler used by the
//! frontend and by tests to produce bytecode.
//!
//! KBC instructions are variable length. The first byte carries the opcode in
//! its low seven bits and a *wide* flag in bit 7. In the narrow form every
//! operand is a single byte; in the wide form the 32-bit operands (`D`, `E`,
//! `X`, `Y`, `T`) are encoded as four little-endian bytes while byte operands
//! (`A`, `F`) stay single bytes. Formats without 32-bit operands (`0`, `A`,
//! `A_B_C`) have no wide form.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod decoder;
pub mod encoder;
pub mod opcode;

pub use decoder::{DecodeError, Instr, Operands};
pub use encoder::{BytecodeWriter, Label};
pub use opcode::{Format, Opcode, WIDE_BIT};
