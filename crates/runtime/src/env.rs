//! Lexical frame access: walking a parent chain `depth` links deep then
//! indexing into that frame, the operation `fref`/`fset`/`extend-env`
//! compile down to. The `Environment`/`Frame` data structures themselves
//! live in `svm-core` (alongside every other `Cell` payload); this module
//! only adds the depth/index walk the bytecode instructions need.
//!
//! Grounded on `examples/original_source/src/core/sexpr.hxx`'s `Frame`
//! parent-chain shape and `eval.hxx`'s `FRAME`/`FRAME_VALUES` access macros.

use crate::error::EvalError;
use svm_core::{AssocEnvironment, Cell, Environment, Frame, Heap, Ref, RegStack, RootSource};

fn as_environment<'h>(heap: &'h Heap, r: Ref) -> Result<&'h Environment, EvalError> {
    match heap.get(r)? {
        Cell::Environment(env) => Ok(env),
        other => Err(EvalError::WrongType {
            expected: "environment",
            got: other.kind_name(),
        }),
    }
}

/// Walk `depth` parent links up from `env`, returning the frame's owning
/// environment cell at that depth. `depth == 0` returns `env` itself.
fn walk(heap: &Heap, env: Ref, depth: u8) -> Result<Ref, EvalError> {
    let mut current = env;
    for _ in 0..depth {
        let e = as_environment(heap, current)?;
        current = e.parent.ok_or(EvalError::WrongType {
            expected: "environment with a parent frame",
            got: "global environment",
        })?;
    }
    Ok(current)
}

/// `fref`: read the slot `index` of the frame `depth` links above `env`.
pub fn fref(heap: &Heap, env: Ref, depth: u8, index: u8) -> Result<Ref, EvalError> {
    let frame_env = walk(heap, env, depth)?;
    let e = as_environment(heap, frame_env)?;
    e.frame.get(index as usize).ok_or(EvalError::IndexOutOfBounds {
        index: index as usize,
        len: e.frame.slots.len(),
    })
}

/// `fset`: overwrite the slot `index` of the frame `depth` links above `env`.
pub fn fset(heap: &mut Heap, env: Ref, depth: u8, index: u8, value: Ref) -> Result<(), EvalError> {
    let frame_env = walk(heap, env, depth)?;
    let len = as_environment(heap, frame_env)?.frame.slots.len();
    match heap.get_mut(frame_env)? {
        Cell::Environment(e) => {
            if e.frame.set(index as usize, value) {
                Ok(())
            } else {
                Err(EvalError::IndexOutOfBounds {
                    index: index as usize,
                    len,
                })
            }
        }
        other => Err(EvalError::WrongType {
            expected: "environment",
            got: other.kind_name(),
        }),
    }
}

/// `eset`: store `val` into slot `index` of the environment currently on top
/// of reg-stack, without popping it — how `let`/`letrec` fill in bindings
/// one evaluated RHS at a time after `extend-env` has pushed the new frame.
pub fn eset(heap: &mut Heap, reg_stack: &RegStack, index: u8, value: Ref) -> Result<(), EvalError> {
    let frame_env = reg_stack.top()?;
    let len = as_environment(heap, frame_env)?.frame.slots.len();
    match heap.get_mut(frame_env)? {
        Cell::Environment(e) => {
            if e.frame.set(index as usize, value) {
                Ok(())
            } else {
                Err(EvalError::IndexOutOfBounds {
                    index: index as usize,
                    len,
                })
            }
        }
        other => Err(EvalError::WrongType {
            expected: "environment",
            got: other.kind_name(),
        }),
    }
}

fn as_assoc_environment<'h>(heap: &'h Heap, r: Ref) -> Result<&'h AssocEnvironment, EvalError> {
    match heap.get(r)? {
        Cell::AssocEnvironment(env) => Ok(env),
        other => Err(EvalError::WrongType {
            expected: "assoc-environment",
            got: other.kind_name(),
        }),
    }
}

/// `get-access`: look up `symbol` in `env` (an assoc-environment), walking
/// its parent chain outward until found.
pub fn access_lookup(heap: &Heap, env: Ref, symbol: Ref) -> Result<Ref, EvalError> {
    let mut current = env;
    loop {
        let e = as_assoc_environment(heap, current)?;
        if let Some(v) = e.lookup(symbol) {
            return Ok(v);
        }
        match e.parent {
            Some(p) => current = p,
            None => return Err(EvalError::UnboundSymbol),
        }
    }
}

/// `set-access`: bind `symbol` to `value` wherever it is already bound in
/// `env`'s parent chain, or at `env` itself if it is bound nowhere.
pub fn access_set(heap: &mut Heap, env: Ref, symbol: Ref, value: Ref) -> Result<(), EvalError> {
    let mut current = env;
    loop {
        if as_assoc_environment(heap, current)?.lookup(symbol).is_some() {
            break;
        }
        match as_assoc_environment(heap, current)?.parent {
            Some(p) => current = p,
            None => {
                current = env;
                break;
            }
        }
    }
    match heap.get_mut(current)? {
        Cell::AssocEnvironment(e) => {
            e.bind(symbol, value);
            Ok(())
        }
        other => Err(EvalError::WrongType {
            expected: "assoc-environment",
            got: other.kind_name(),
        }),
    }
}

/// `extend-env r n kv`: allocate a frame of `n` slots (initialized to
/// `null`) with parameter list `kv`, chained above `env`. Slots are filled
/// in afterward one at a time via `eset` — this is how `let`/`letrec`
/// compile, evaluating each binding's RHS before writing it into the new
/// frame, rather than pushing arguments onto the arg-stack.
pub fn extend_env(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    env: Ref,
    null: Ref,
    nvars: usize,
    vars: Ref,
) -> Result<Ref, EvalError> {
    let frame = Frame::new(vec![null; nvars], false, vars);
    let cell = Cell::Environment(Environment {
        frame,
        parent: Some(env),
    });
    Ok(heap.alloc(cell, roots)?)
}

/// Bind already-evaluated procedure-call arguments into a fresh frame
/// chained above `env` — the ordinary closure-application path, distinct
/// from the `extend-env` instruction above (which builds an empty frame
/// filled in later by `eset`). `vars` records the closure's own parameter
/// list for the frame to carry, matching `extend-env`'s frame shape.
pub fn bind_env(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    env: Ref,
    values: Vec<Ref>,
    has_rest: bool,
    vars: Ref,
) -> Result<Ref, EvalError> {
    let frame = Frame::new(values, has_rest, vars);
    let cell = Cell::Environment(Environment {
        frame,
        parent: Some(env),
    });
    Ok(heap.alloc(cell, roots)?)
}
