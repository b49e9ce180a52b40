//! Error taxonomy for the assembler and the VM, matching spec.md §7 exactly.
//! Hand-rolled enums in the teacher's `CodeGenError` style: no `thiserror`.

use std::error::Error;
use std::fmt;
use svm_core::{HeapError, PrimitiveError, StackError};

/// Assembly-time failures (spec.md §7's `ConstPoolOverflow`/`BadInstruction`
/// rows, plus the unknown-opcode/register cases the encode algorithm names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmError {
    ConstPoolOverflow { size: usize },
    BadInstruction(String),
    UnknownOpcode(u8),
    UnknownRegister(u8),
    UnresolvedLabel(u32),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::ConstPoolOverflow { size } => {
                write!(f, "constant pool overflow: {size} entries exceeds the 256-entry limit")
            }
            AsmError::BadInstruction(msg) => write!(f, "malformed instruction: {msg}"),
            AsmError::UnknownOpcode(b) => write!(f, "unknown opcode byte {b}"),
            AsmError::UnknownRegister(b) => write!(f, "unknown register index {b}"),
            AsmError::UnresolvedLabel(id) => write!(f, "label {id} is never defined"),
        }
    }
}

impl Error for AsmError {}

/// Runtime failures raised while the VM is executing, exactly the taxonomy
/// spec.md §7 lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    UnboundSymbol,
    NotCallable { kind: &'static str },
    WrongType { expected: &'static str, got: &'static str },
    ArityMismatch { expected: String, got: usize },
    BadOpcode(u8),
    BadConstantIndex { index: usize, pool_size: usize },
    IndexOutOfBounds { index: usize, len: usize },
    Heap(HeapError),
    Stack(StackError),
    Primitive(PrimitiveError),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnboundSymbol => write!(f, "unbound symbol"),
            EvalError::NotCallable { kind } => write!(f, "not callable: {kind}"),
            EvalError::WrongType { expected, got } => {
                write!(f, "wrong type: expected {expected}, got {got}")
            }
            EvalError::ArityMismatch { expected, got } => {
                write!(f, "arity mismatch: expected {expected}, got {got}")
            }
            EvalError::BadOpcode(b) => write!(f, "bad opcode: {b}"),
            EvalError::BadConstantIndex { index, pool_size } => {
                write!(f, "constant index {index} out of range (pool size {pool_size})")
            }
            EvalError::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds (len {len})")
            }
            EvalError::Heap(e) => write!(f, "{e}"),
            EvalError::Stack(e) => write!(f, "{e}"),
            EvalError::Primitive(e) => write!(f, "{e}"),
        }
    }
}

impl Error for EvalError {}

impl From<HeapError> for EvalError {
    fn from(e: HeapError) -> Self {
        EvalError::Heap(e)
    }
}

impl From<StackError> for EvalError {
    fn from(e: StackError) -> Self {
        EvalError::Stack(e)
    }
}

impl From<PrimitiveError> for EvalError {
    fn from(e: PrimitiveError) -> Self {
        EvalError::Primitive(e)
    }
}
