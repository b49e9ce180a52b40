//! First-class continuation capture/restore: a full snapshot of the three
//! explicit stacks plus the live `env`/`unev` registers, copied by value.
//!
//! Grounded on `examples/original_source/src/eval/bceval.cxx`'s
//! `n_continuation`/`n_callcc` handling; `create_continuation`/
//! `restore_continuation`'s bodies were not present in the retrieved
//! source, so the snapshot shape here is reconstructed from spec.md §4.9
//! and the stack fields `bceval.cxx` reads at each call site.

use crate::error::EvalError;
use std::rc::Rc;
use svm_core::{ArgStack, Cell, ContinuationCell, Heap, IntStack, Ref, RegStack, RootSource};

/// Snapshot every stack plus the registers a restore needs to resume
/// execution exactly where `call/cc` captured it, and heap-allocate the
/// result as a `Cell::Continuation`.
pub fn capture(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    reg_stack: &RegStack,
    arg_stack: &ArgStack,
    int_stack: &IntStack,
    env: Ref,
    unev: Ref,
) -> Result<Ref, EvalError> {
    let (arg_items, arg_count) = arg_stack.snapshot();
    let cell = ContinuationCell {
        reg_stack: reg_stack.snapshot(),
        arg_stack: arg_items,
        arg_count,
        int_stack: int_stack.snapshot(),
        env,
        unev,
    };
    Ok(heap.alloc(Cell::Continuation(Rc::new(cell)), roots)?)
}

/// Restore every stack from a previously captured continuation, returning
/// the `(env, unev)` pair the caller should install before resuming. This
/// discards whatever was on the stacks beforehand — invoking a continuation
/// is a full replace, not a merge.
pub fn restore(
    heap: &Heap,
    cont_ref: Ref,
    reg_stack: &mut RegStack,
    arg_stack: &mut ArgStack,
    int_stack: &mut IntStack,
) -> Result<(Ref, Ref), EvalError> {
    let snap = match heap.get(cont_ref)? {
        Cell::Continuation(c) => Rc::clone(c),
        other => {
            return Err(EvalError::WrongType {
                expected: "continuation",
                got: other.kind_name(),
            })
        }
    };
    reg_stack.restore(snap.reg_stack.clone());
    arg_stack.restore(snap.arg_stack.clone(), snap.arg_count);
    int_stack.restore(snap.int_stack.clone());
    Ok((snap.env, snap.unev))
}
