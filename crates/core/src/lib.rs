//! Data model and storage layer for a register-based Scheme bytecode VM.
//!
//! This crate owns everything spec.md's data model describes: the tagged
//! [`cell::Cell`] sum type, the index-addressed [`heap::Heap`] arena with its
//! mark-sweep collector, the append-only [`symtab::SymbolTable`], and the
//! three explicit stacks ([`stacks::RegStack`], [`stacks::ArgStack`],
//! [`stacks::IntStack`]) the dispatch loop in `svm-runtime` drives. It knows
//! nothing about bytecode, opcodes, or evaluation order — that behavior
//! lives one layer up.
//!
//! # Modules
//!
//! - `cell`: the tagged `Cell` enum and the small structs it embeds
//!   (`Frame`, `Environment`, `Closure`, `Promise`, ...)
//! - `heap`: arena allocation, mark-sweep GC, external-root registration
//! - `stacks`: `RegStack`, `ArgStack`, `IntStack`
//! - `symtab`: symbol interning
//! - `error`: `HeapError`, `StackError`

pub mod cell;
pub mod error;
pub mod heap;
pub mod stacks;
pub mod symtab;

pub use cell::{
    AssocEnvironment, Arity, Cell, Closure, CodeObject, ContinuationCell, Environment, Frame,
    Operator, Port, PortKind, PortMode, Primitive, PrimitiveError, Promise, SymbolCell,
};
pub use error::{HeapError, StackError};
pub use heap::{Heap, Ref, RootSource};
pub use stacks::{ArgStack, IntStack, RegStack};
pub use symtab::SymbolTable;
