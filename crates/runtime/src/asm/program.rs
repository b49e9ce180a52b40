//! The assembler's input contract: a typed, in-memory rendering of the
//! symbolic instruction list from spec.md §6's grammar. Because the
//! S-expression reader is out of scope for this core, a compiler
//! collaborator hands us this `Program` directly rather than text to parse.

use crate::code::{Reg, RefReg};
use svm_core::Ref;

/// A label position, recorded by the assembler the first time it is
/// defined or referenced; spec.md allows either a symbol or a fixnum as the
/// label key, so this is an opaque caller-assigned identifier rather than a
/// parsed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Either a forward/backward jump to a label, or the dedicated
/// `branch-cont`/`goto-cont` opcode spec.md's grammar writes as
/// `(branch (reg cont))` / `(goto (reg cont))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Label(LabelId),
    Cont,
}

/// One program element: either a label definition or an instruction.
#[derive(Debug, Clone)]
pub enum Item {
    Label(LabelId),
    Instr(Instr),
}

/// The assembler's own evaluation of which `<reg>` operands in spec.md §6's
/// grammar are load-bearing: `fref`/`extend-env` carry a real destination
/// register (the original sources use it), every other instruction's
/// `[<reg>]` is vestigial and always targets `val`. See the encode module's
/// doc comment and `DESIGN.md` for the grounding.
#[derive(Debug, Clone)]
pub enum Instr {
    Save(Reg),
    Restore(Reg),
    ZeroArgc,
    PushArg,
    PopArgs,
    /// `(assign val (reg <reg>))` — val ← the named register.
    AssignReg(Reg),
    /// `(assign val (const X))` — val ← the constant, interned by `eqv?`.
    AssignConst(Ref),
    Gref(Ref),
    Gset(Ref),
    Gdef(Ref),
    Fref { dest: RefReg, depth: u8, index: u8 },
    Fset { depth: u8, index: u8 },
    GetAccess(Ref),
    SetAccess(Ref),
    /// `(make-closure <nested-program> <params> <num> <rest>)`.
    MakeClosure {
        body: Program,
        params: Ref,
        numv: u8,
        rest: bool,
    },
    Apply,
    ApplyCont,
    TestTrue,
    TestFalse,
    Branch(Target),
    Goto(Target),
    MapInit,
    MapApply,
    MapResult,
    ForInit,
    ForApply,
    ForResult,
    ExtendEnv { dest: RefReg, nvars: u8, vars: Ref },
    Eset(u8),
    Delay(Program),
    Rte,
    Rtc,
}

/// A symbolic instruction list: `program ::= (item ...)` from spec.md §6.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn new() -> Self {
        Program { items: Vec::new() }
    }

    pub fn label(mut self, id: LabelId) -> Self {
        self.items.push(Item::Label(id));
        self
    }

    pub fn instr(mut self, instr: Instr) -> Self {
        self.items.push(Item::Instr(instr));
        self
    }
}
