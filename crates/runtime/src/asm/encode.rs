//! The assembler proper: `Program` → packed bytecode + constant pool.
//!
//! Grounded on `examples/original_source/src/eval/assem.cxx`'s `encode()`:
//! a single linear walk that records label addresses, emits opcode bytes,
//! interns `(const X)` operands into the constant pool under `eqv?`, and
//! folds common instruction pairs into fused opcodes via a one-instruction
//! sliding pipeline. Forward jumps are two zero bytes at emit time, patched
//! in a second pass once every label's address is known.

use crate::asm::program::{Instr, Item, LabelId, Program, Target};
use crate::code::{Code, Opcode, Reg};
use crate::error::AsmError;
use std::collections::HashMap;
use svm_core::{Cell, Heap, Ref, RootSource};

/// Which opcode currently sits at the tail of the emitted stream and is
/// eligible to be folded into a fused opcode by a following
/// `push-arg`/`apply`/`apply-cont`.
#[derive(Clone, Copy)]
enum Fusable {
    AssignReg,
    AssignObj,
    Gref,
    Fref,
    GetAccess,
}

#[derive(Clone, Copy)]
enum FuseTarget {
    PushArg,
    Apply,
    ApplyCont,
}

fn fused(kind: Fusable, target: FuseTarget) -> Opcode {
    use Fusable::*;
    use FuseTarget::*;
    match (kind, target) {
        (AssignReg, PushArg) => Opcode::AssignRegPushArg,
        (AssignReg, Apply) => Opcode::AssignRegApply,
        (AssignReg, ApplyCont) => Opcode::AssignRegApplyCont,
        (AssignObj, PushArg) => Opcode::AssignObjPushArg,
        (AssignObj, Apply) => Opcode::AssignObjApply,
        (AssignObj, ApplyCont) => Opcode::AssignObjApplyCont,
        (Gref, PushArg) => Opcode::GrefPushArg,
        (Gref, Apply) => Opcode::GrefApply,
        (Gref, ApplyCont) => Opcode::GrefApplyCont,
        (Fref, PushArg) => Opcode::FrefPushArg,
        (Fref, Apply) => Opcode::FrefApply,
        (Fref, ApplyCont) => Opcode::FrefApplyCont,
        (GetAccess, PushArg) => Opcode::GetAccessPushArg,
        (GetAccess, Apply) => Opcode::GetAccessApply,
        (GetAccess, ApplyCont) => Opcode::GetAccessApplyCont,
    }
}

fn save_opcode(r: Reg) -> Opcode {
    match r {
        Reg::Val => Opcode::SaveVal,
        Reg::Aux => Opcode::SaveAux,
        Reg::Env => Opcode::SaveEnv,
        Reg::Unev => Opcode::SaveUnev,
        Reg::Exp => Opcode::SaveExp,
        Reg::Argc => Opcode::SaveArgc,
    }
}

fn restore_opcode(r: Reg) -> Opcode {
    match r {
        Reg::Val => Opcode::RestoreVal,
        Reg::Aux => Opcode::RestoreAux,
        Reg::Env => Opcode::RestoreEnv,
        Reg::Unev => Opcode::RestoreUnev,
        Reg::Exp => Opcode::RestoreExp,
        Reg::Argc => Opcode::RestoreArgc,
    }
}

/// `eqv?` over constant-pool candidates: numeric/char literals compare by
/// value (two distinct cells holding `7` are the same constant), everything
/// else compares by heap identity.
fn eqv(heap: &Heap, a: Ref, b: Ref) -> bool {
    if a == b {
        return true;
    }
    match (heap.get(a), heap.get(b)) {
        (Ok(Cell::Fixnum(x)), Ok(Cell::Fixnum(y))) => x == y,
        (Ok(Cell::Flonum(x)), Ok(Cell::Flonum(y))) => x == y,
        (Ok(Cell::Char(x)), Ok(Cell::Char(y))) => x == y,
        _ => false,
    }
}

/// Accumulates one code object's worth of bytecode + constant pool. Nested
/// `make-closure`/`delay` bodies get their own `Encoder`, recursively, and
/// are folded into the parent's pool as a single `Ref` to an already
/// heap-allocated code cell.
struct Encoder {
    bytecode: Vec<u8>,
    pool: Vec<Ref>,
    labels: HashMap<LabelId, usize>,
    fixups: Vec<(usize, LabelId)>,
    pipeline: Option<(usize, Fusable)>,
}

impl Encoder {
    fn new() -> Self {
        Encoder {
            bytecode: Vec::new(),
            pool: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            pipeline: None,
        }
    }

    fn add_const(&mut self, heap: &Heap, value: Ref) -> Result<u8, AsmError> {
        if let Some(idx) = self.pool.iter().position(|&c| eqv(heap, c, value)) {
            return Ok(idx as u8);
        }
        if self.pool.len() >= 256 {
            return Err(AsmError::ConstPoolOverflow {
                size: self.pool.len() + 1,
            });
        }
        self.pool.push(value);
        Ok((self.pool.len() - 1) as u8)
    }

    fn here(&self) -> usize {
        self.bytecode.len()
    }

    fn flush_pipeline(&mut self) {
        self.pipeline = None;
    }

    fn emit_op(&mut self, op: Opcode) -> usize {
        let pos = self.here();
        self.bytecode.push(op as u8);
        pos
    }

    fn emit_simple(&mut self, op: Opcode) {
        self.emit_op(op);
        self.flush_pipeline();
    }

    fn emit_fusable(&mut self, op: Opcode, operand: &[u8], kind: Fusable) {
        let pos = self.emit_op(op);
        self.bytecode.extend_from_slice(operand);
        self.pipeline = Some((pos, kind));
    }

    /// `push-arg`, `apply`, and `apply-cont` are the three fusion targets.
    /// If the previous instruction is still eligible, fold it in place and
    /// drop this opcode's own byte entirely; otherwise emit it plainly.
    fn emit_fusion_target(&mut self, plain: Opcode, kind_to_fused: impl Fn(Fusable) -> Opcode) {
        match self.pipeline.take() {
            Some((pos, kind)) => {
                self.bytecode[pos] = kind_to_fused(kind) as u8;
            }
            None => {
                self.emit_op(plain);
            }
        }
    }

    fn emit_label_fixup(&mut self, target: Target, label_op: Opcode, cont_op: Opcode) {
        match target {
            Target::Cont => self.emit_simple(cont_op),
            Target::Label(id) => {
                self.emit_op(label_op);
                self.fixups.push((self.here(), id));
                self.bytecode.extend_from_slice(&[0, 0]);
                self.flush_pipeline();
            }
        }
    }

    fn encode_program(
        &mut self,
        heap: &mut Heap,
        roots: &[&dyn RootSource],
        program: &Program,
    ) -> Result<(), AsmError> {
        for item in &program.items {
            match item {
                Item::Label(id) => {
                    self.labels.insert(*id, self.here());
                    self.flush_pipeline();
                }
                Item::Instr(instr) => self.encode_instr(heap, roots, instr)?,
            }
        }
        Ok(())
    }

    fn encode_instr(
        &mut self,
        heap: &mut Heap,
        roots: &[&dyn RootSource],
        instr: &Instr,
    ) -> Result<(), AsmError> {
        match instr {
            Instr::Save(r) => self.emit_simple(save_opcode(*r)),
            Instr::Restore(r) => self.emit_simple(restore_opcode(*r)),
            Instr::ZeroArgc => self.emit_simple(Opcode::ZeroArgc),
            Instr::PushArg => {
                self.emit_fusion_target(Opcode::PushArg, |k| fused(k, FuseTarget::PushArg))
            }
            Instr::PopArgs => self.emit_simple(Opcode::PopArgs),
            Instr::AssignReg(r) => {
                self.emit_fusable(Opcode::AssignReg, &[*r as u8], Fusable::AssignReg)
            }
            Instr::AssignConst(value) => {
                let idx = self.add_const(heap, *value)?;
                self.emit_fusable(Opcode::AssignObj, &[idx], Fusable::AssignObj)
            }
            Instr::Gref(sym) => {
                let idx = self.add_const(heap, *sym)?;
                self.emit_fusable(Opcode::Gref, &[idx], Fusable::Gref)
            }
            Instr::Gset(sym) => {
                let idx = self.add_const(heap, *sym)?;
                self.emit_op(Opcode::Gset);
                self.bytecode.push(idx);
                self.flush_pipeline();
            }
            Instr::Gdef(sym) => {
                let idx = self.add_const(heap, *sym)?;
                self.emit_op(Opcode::Gdef);
                self.bytecode.push(idx);
                self.flush_pipeline();
            }
            Instr::Fref { dest, depth, index } => self.emit_fusable(
                Opcode::Fref,
                &[*dest as u8, *depth, *index],
                Fusable::Fref,
            ),
            Instr::Fset { depth, index } => {
                self.emit_op(Opcode::Fset);
                self.bytecode.extend_from_slice(&[*depth, *index]);
                self.flush_pipeline();
            }
            Instr::GetAccess(sym) => {
                let idx = self.add_const(heap, *sym)?;
                self.emit_fusable(Opcode::GetAccess, &[idx], Fusable::GetAccess)
            }
            Instr::SetAccess(sym) => {
                let idx = self.add_const(heap, *sym)?;
                self.emit_op(Opcode::SetAccess);
                self.bytecode.push(idx);
                self.flush_pipeline();
            }
            Instr::MakeClosure {
                body,
                params,
                numv,
                rest,
            } => {
                let code_ref = encode(heap, roots, body)?;
                let code_idx = self.add_const(heap, code_ref)?;
                let params_idx = self.add_const(heap, *params)?;
                self.emit_op(Opcode::MakeClosure);
                self.bytecode
                    .extend_from_slice(&[code_idx, params_idx, *numv, *rest as u8]);
                self.flush_pipeline();
            }
            Instr::Delay(body) => {
                let code_ref = encode(heap, roots, body)?;
                let idx = self.add_const(heap, code_ref)?;
                self.emit_op(Opcode::Delay);
                self.bytecode.push(idx);
                self.flush_pipeline();
            }
            Instr::Apply => {
                self.emit_fusion_target(Opcode::Apply, |k| fused(k, FuseTarget::Apply))
            }
            Instr::ApplyCont => {
                self.emit_fusion_target(Opcode::ApplyCont, |k| fused(k, FuseTarget::ApplyCont))
            }
            Instr::TestTrue => self.emit_simple(Opcode::TestTrue),
            Instr::TestFalse => self.emit_simple(Opcode::TestFalse),
            Instr::Branch(target) => {
                self.emit_label_fixup(*target, Opcode::Branch, Opcode::BranchCont)
            }
            Instr::Goto(target) => {
                self.emit_label_fixup(*target, Opcode::Goto, Opcode::GotoCont)
            }
            Instr::MapInit => self.emit_simple(Opcode::MapInit),
            Instr::MapApply => self.emit_simple(Opcode::MapApply),
            Instr::MapResult => self.emit_simple(Opcode::MapResult),
            Instr::ForInit => self.emit_simple(Opcode::ForInit),
            Instr::ForApply => self.emit_simple(Opcode::ForApply),
            Instr::ForResult => self.emit_simple(Opcode::ForResult),
            Instr::ExtendEnv { dest, nvars, vars } => {
                let idx = self.add_const(heap, *vars)?;
                self.emit_op(Opcode::ExtendEnv);
                self.bytecode.extend_from_slice(&[*dest as u8, *nvars, idx]);
                self.flush_pipeline();
            }
            Instr::Eset(index) => {
                self.emit_op(Opcode::Eset);
                self.bytecode.push(*index);
                self.flush_pipeline();
            }
            Instr::Rte => self.emit_simple(Opcode::Rtc), // dropped outer interpreter: rte == rtc
            Instr::Rtc => self.emit_simple(Opcode::Rtc),
        }
        Ok(())
    }

    fn resolve_fixups(&mut self) -> Result<(), AsmError> {
        for (patch_at, label) in self.fixups.clone() {
            let addr = *self
                .labels
                .get(&label)
                .ok_or(AsmError::UnresolvedLabel(label.0))?;
            let addr = u16::try_from(addr).map_err(|_| {
                AsmError::BadInstruction(format!("jump target {addr} exceeds 16 bits"))
            })?;
            let bytes = addr.to_le_bytes();
            self.bytecode[patch_at] = bytes[0];
            self.bytecode[patch_at + 1] = bytes[1];
        }
        Ok(())
    }
}

/// Assemble `program` into a code cell, heap-allocating it (and, via the
/// recursive calls in `encode_instr`, any nested `make-closure`/`delay`
/// bodies first) as `Cell::Code`. Returns the `Ref` to the code cell.
pub fn encode(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    program: &Program,
) -> Result<Ref, AsmError> {
    let mut enc = Encoder::new();
    enc.encode_program(heap, roots, program)?;
    enc.resolve_fixups()?;

    let code = Code::new(enc.bytecode, enc.pool);
    let cell = Cell::Code(svm_core::CodeObject {
        bytecode: code.bytecode.into(),
        constants: code.constants.into(),
    });
    heap.alloc(cell, roots).map_err(|e| {
        AsmError::BadInstruction(format!("heap allocation failed while assembling: {e}"))
    })
}
