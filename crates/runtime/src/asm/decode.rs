//! The disassembler: recovers a readable instruction listing from packed
//! bytecode, driven entirely by `OPCODE_LEN` rather than duplicating each
//! opcode's operand shape a second time.
//!
//! Grounded on `examples/original_source/src/eval/assem.cxx`'s `decode()`:
//! walk the byte buffer from 0, print the opcode name plus any operands,
//! and recurse into a nested code cell whenever `make-closure`/`delay`'s
//! constant-pool operand turns out to be one.

use crate::code::{Code, Opcode, OPCODE_LEN};
use crate::error::AsmError;
use std::fmt::Write as _;
use svm_core::{Cell, Heap, Ref};

/// One decoded instruction: its offset, opcode, and a human-readable line.
#[derive(Debug, Clone)]
pub struct DecodedInstr {
    pub offset: usize,
    pub opcode: Opcode,
    pub text: String,
}

/// Decode `code`'s flat bytecode into one `DecodedInstr` per instruction.
/// Does not recurse into nested code cells; see [`disassemble`] for that.
pub fn decode_flat(code: &Code) -> Result<Vec<DecodedInstr>, AsmError> {
    let bc = &code.bytecode;
    let mut out = Vec::new();
    let mut pc = 0usize;
    while pc < bc.len() {
        let byte = bc[pc];
        let opcode = Opcode::from_byte(byte).ok_or(AsmError::UnknownOpcode(byte))?;
        let len = OPCODE_LEN[byte as usize] as usize;
        if pc + len > bc.len() {
            return Err(AsmError::BadInstruction(format!(
                "instruction at offset {pc} ({opcode:?}) needs {len} bytes past end of buffer"
            )));
        }
        let operands = &bc[pc + 1..pc + len];
        let text = format_instr(opcode, operands, code);
        out.push(DecodedInstr {
            offset: pc,
            opcode,
            text,
        });
        pc += len;
    }
    Ok(out)
}

fn format_instr(opcode: Opcode, operands: &[u8], code: &Code) -> String {
    let mut s = format!("{opcode:?}");
    match operands.len() {
        0 => {}
        1 => {
            let _ = write!(s, " {}", operands[0]);
        }
        _ => {
            for b in operands {
                let _ = write!(s, " {b}");
            }
        }
    }
    if matches!(
        opcode,
        Opcode::AssignObj
            | Opcode::Gref
            | Opcode::Gset
            | Opcode::Gdef
            | Opcode::GetAccess
            | Opcode::SetAccess
            | Opcode::AssignObjPushArg
            | Opcode::AssignObjApply
            | Opcode::AssignObjApplyCont
            | Opcode::GrefPushArg
            | Opcode::GrefApply
            | Opcode::GrefApplyCont
            | Opcode::GetAccessPushArg
            | Opcode::GetAccessApply
            | Opcode::GetAccessApplyCont
    ) {
        if let Some(&idx) = operands.first() {
            if let Some(cref) = code.constants.get(idx as usize) {
                let _ = write!(s, "  ; const[{idx}] = {cref:?}");
            }
        }
    }
    s
}

/// Disassemble the code cell at `root`, recursing into every
/// `make-closure`/`delay` body reachable from its constant pool. Nested
/// listings are indented one level per nesting depth, matching the
/// original disassembler's indentation convention.
pub fn disassemble(heap: &Heap, root: Ref) -> Result<String, AsmError> {
    let mut out = String::new();
    disassemble_into(heap, root, 0, &mut out)?;
    Ok(out)
}

fn disassemble_into(
    heap: &Heap,
    code_ref: Ref,
    depth: usize,
    out: &mut String,
) -> Result<(), AsmError> {
    let cell = heap
        .get(code_ref)
        .map_err(|e| AsmError::BadInstruction(format!("{e}")))?;
    let Cell::Code(code_obj) = cell else {
        return Err(AsmError::BadInstruction(
            "disassemble target is not a code cell".into(),
        ));
    };
    let code = Code::new(code_obj.bytecode.to_vec(), code_obj.constants.to_vec());
    let indent = "  ".repeat(depth);
    let instrs = decode_flat(&code)?;

    let mut nested = Vec::new();
    for instr in &instrs {
        let _ = writeln!(out, "{indent}{:04}  {}", instr.offset, instr.text);
        if matches!(instr.opcode, Opcode::MakeClosure | Opcode::Delay) {
            let byte_off = instr.offset + 1;
            let idx = code.bytecode[byte_off] as usize;
            if let Some(&cref) = code.constants.get(idx) {
                if let Ok(Cell::Code(_)) = heap.get(cref) {
                    nested.push(cref);
                }
            }
        }
    }
    for cref in nested {
        let _ = writeln!(out, "{indent}-- nested code cell --");
        disassemble_into(heap, cref, depth + 1, out)?;
    }
    Ok(())
}
