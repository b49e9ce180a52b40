//! Application dispatch: classifying what `val` is callable *as*, the
//! arity pre-check for ordinary closures, and the cons-list plumbing
//! `apply`/`map`/`for-each` share.
//!
//! Grounded on `examples/original_source/src/eval/bceval.cxx`'s `n_apply`
//! dispatch (the primitive/closure/operator case split) and spec.md §4.7.
//! `map`/`for-each`/`force` are reified as distinguished [`Operator`] values
//! here rather than hand-assembled `map_code`/`for_code` bytecode library
//! routines: the library-routine source (`map.cxx`-equivalent) was not
//! present in the retrieved original sources, only `assem.cxx`/`bceval.cxx`/
//! `code.hxx`/`eval.hxx`, so the VM drives these three operators with a
//! native recursive helper instead (see `vm.rs` and `DESIGN.md`).

use crate::env::bind_env;
use crate::error::EvalError;
use std::rc::Rc;
use svm_core::{Cell, Closure, Heap, Operator, Primitive, Ref, RootSource};

/// What applying `val` actually means, resolved from its heap cell kind.
#[derive(Debug, Clone)]
pub enum Callee {
    Primitive(Rc<dyn Primitive>),
    Closure(Closure),
    Continuation(Ref),
    Apply,
    Eval,
    CallCc,
    Map,
    ForEach,
    Force,
}

pub fn classify(heap: &Heap, val: Ref) -> Result<Callee, EvalError> {
    match heap.get(val)? {
        Cell::Primitive(p) => Ok(Callee::Primitive(Rc::clone(p))),
        Cell::Closure(c) => Ok(Callee::Closure(*c)),
        Cell::Continuation(_) => Ok(Callee::Continuation(val)),
        Cell::Operator(op) => Ok(match op {
            Operator::Apply => Callee::Apply,
            Operator::Eval => Callee::Eval,
            Operator::CallCc => Callee::CallCc,
            Operator::Map => Callee::Map,
            Operator::ForEach => Callee::ForEach,
            Operator::Force => Callee::Force,
        }),
        other => Err(EvalError::NotCallable { kind: other.kind_name() }),
    }
}

/// The arity check spec.md §4.7 assigns to closure application, run before
/// control ever transfers into the closure's code — the closure body's own
/// `extend-env` instruction does the actual binding, trusting that this
/// check already passed.
pub fn check_closure_arity(closure: &Closure, argc: usize) -> Result<(), EvalError> {
    let numv = closure.numv as usize;
    if closure.rest {
        let fixed = numv.saturating_sub(1);
        if argc < fixed {
            return Err(EvalError::ArityMismatch {
                expected: format!("at least {fixed}"),
                got: argc,
            });
        }
    } else if argc != numv {
        return Err(EvalError::ArityMismatch {
            expected: numv.to_string(),
            got: argc,
        });
    }
    Ok(())
}

/// Bind `args` into a fresh frame chained above `closure.env`, per spec.md
/// §4.7: `closure.numv` fixed slots, the last collecting a freshly-consed
/// rest list when `closure.rest`. Callers must have already run
/// [`check_closure_arity`] — this trusts `args.len()` is valid for `closure`.
pub fn bind_closure_args(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    null: Ref,
    closure: Closure,
    args: Vec<Ref>,
) -> Result<Ref, EvalError> {
    let numv = closure.numv as usize;
    if closure.rest {
        let fixed = numv.saturating_sub(1);
        let mut it = args.into_iter();
        let mut slots: Vec<Ref> = (&mut it).take(fixed).collect();
        let rest_items: Vec<Ref> = it.collect();
        slots.push(vec_to_list(heap, roots, null, &rest_items)?);
        bind_env(heap, roots, closure.env, slots, true, closure.params)
    } else {
        bind_env(heap, roots, closure.env, args, false, closure.params)
    }
}

/// Walk a proper list, collecting its elements, erroring if it is not
/// `null`-terminated (an improper/dotted list where a proper one is
/// required — `apply`'s final argument, `map`/`for-each`'s list arguments).
pub fn list_to_vec(heap: &Heap, null: Ref, mut list: Ref) -> Result<Vec<Ref>, EvalError> {
    let mut items = Vec::new();
    while list != null {
        match heap.get(list)? {
            Cell::Cons(car, cdr) => {
                items.push(*car);
                list = *cdr;
            }
            other => {
                return Err(EvalError::WrongType {
                    expected: "proper list",
                    got: other.kind_name(),
                })
            }
        }
    }
    Ok(items)
}

/// Build a freshly-allocated proper list from `items`, terminated by the
/// canonical `null` cell (never a fresh `Cell::Null`, per the "exactly one
/// canonical null" invariant).
pub fn vec_to_list(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    null: Ref,
    items: &[Ref],
) -> Result<Ref, EvalError> {
    let mut list = null;
    for item in items.iter().rev() {
        list = heap.alloc(Cell::Cons(*item, list), roots)?;
    }
    Ok(list)
}
