//! `delay`/`force` semantics: a promise remembers its unevaluated
//! expression and capturing environment until first forced, then memoizes
//! the result and forgets both.
//!
//! Grounded on `examples/original_source/src/eval/bceval.cxx`'s `n_force`
//! case and the `OP_FORCE_VALUE` handler (force, then patch the promise
//! cell in place so a second force is a cache hit).

use crate::error::EvalError;
use svm_core::{Cell, Heap, Ref};

/// What `force` should do next: the promise was already resolved, or the
/// caller needs to evaluate `expr` in `env` and then call [`resolve`] with
/// the result.
#[derive(Debug, Clone, Copy)]
pub enum ForceOutcome {
    Cached(Ref),
    NeedsEval { expr: Ref, env: Ref },
}

pub fn force(heap: &Heap, promise_ref: Ref) -> Result<ForceOutcome, EvalError> {
    match heap.get(promise_ref)? {
        Cell::Promise(p) => {
            if let Some(value) = p.value {
                return Ok(ForceOutcome::Cached(value));
            }
            let expr = p.expr.ok_or_else(|| EvalError::WrongType {
                expected: "promise with a pending expression",
                got: "promise with neither expr nor value",
            })?;
            Ok(ForceOutcome::NeedsEval { expr, env: p.env })
        }
        other => Err(EvalError::WrongType {
            expected: "promise",
            got: other.kind_name(),
        }),
    }
}

/// Memoize `value` as the result of forcing `promise_ref`, dropping the
/// pending expression — forcing the same promise again is now a no-op
/// that returns the cached value.
pub fn resolve(heap: &mut Heap, promise_ref: Ref, value: Ref) -> Result<(), EvalError> {
    match heap.get_mut(promise_ref)? {
        Cell::Promise(p) => {
            p.expr = None;
            p.value = Some(value);
            Ok(())
        }
        other => Err(EvalError::WrongType {
            expected: "promise",
            got: other.kind_name(),
        }),
    }
}
