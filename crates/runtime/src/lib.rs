//! Assembler, register-based bytecode VM, and control-flow machinery for a
//! Scheme execution core.
//!
//! This crate is the layer above `svm-core`: it knows what the 62 opcodes
//! mean, how the assembler grammar compiles down to them, how application
//! dispatch tells a primitive from a closure from a captured continuation,
//! and how the dispatch loop itself runs. `svm-core` only holds the data
//! model (`Cell`, `Heap`, the three stacks) and has no notion of bytecode.
//!
//! # Modules
//!
//! - `code`: the opcode table and the packed `Code` object
//! - `asm`: the assembler grammar (`Instr`/`Program`) and its encoder
//! - `env`: frame/depth-index access (`fref`/`fset`/`extend-env`/`eset`) and
//!   the symbol-keyed `access` forms
//! - `apply`: application dispatch classification and closure argument binding
//! - `continuation`: first-class continuation capture/restore
//! - `promise`: `delay`/`force` memoization
//! - `vm`: the `Vm` register file and its dispatch loop
//! - `primitive`: the argument-iterator calling convention primitives use
//! - `port`: port cell lifecycle tracking
//! - `config`: runtime-tunable stack/heap capacities
//! - `error`: `AsmError`, `EvalError`

pub mod apply;
pub mod asm;
pub mod code;
pub mod config;
pub mod continuation;
pub mod env;
pub mod error;
pub mod port;
pub mod primitive;
pub mod promise;
pub mod vm;

pub use apply::{classify, Callee};
pub use code::{Code, Opcode, Reg, RefReg, OPCODE_COUNT, OPCODE_LEN};
pub use config::VmConfig;
pub use error::{AsmError, EvalError};
pub use primitive::ArgIter;
pub use promise::ForceOutcome;
pub use vm::Vm;
