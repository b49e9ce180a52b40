//! The assembler: a typed program representation, an encoder that packs it
//! into bytecode, and a decoder that recovers a readable listing from
//! packed bytecode for tracing and tests.

pub mod decode;
pub mod encode;
pub mod program;

pub use encode::encode;
pub use program::{Instr, Item, LabelId, Program, Target};
