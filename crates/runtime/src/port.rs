//! Port cell lifecycle: open/close/finalize bookkeeping only. Actual
//! byte-level I/O (reading/writing characters, buffering) belongs to a
//! primitive library layered on top of this core and is out of scope here;
//! this module just tracks whether a port handle is live, the same way
//! the teacher's scoped-resource modules separate "is this handle open"
//! from "what do I do with the bytes".
//!
//! Grounded on the teacher's `crates/runtime/src/file.rs` / `tcp.rs`
//! open-via-factory / explicit-close / finalize-on-drop shape.

use crate::error::EvalError;
use svm_core::{Cell, Heap, Port, PortKind, PortMode, Ref, RootSource};

/// Allocate a new, open port cell of the given kind and mode.
pub fn open(
    heap: &mut Heap,
    roots: &[&dyn RootSource],
    kind: PortKind,
    mode: PortMode,
) -> Result<Ref, EvalError> {
    let port = Port {
        kind,
        mode,
        open: true,
    };
    Ok(heap.alloc(Cell::Port(port), roots)?)
}

/// Mark a port cell closed. Closing an already-closed port is a no-op,
/// matching `close-port`'s idempotence in the original sources.
pub fn close(heap: &mut Heap, port_ref: Ref) -> Result<(), EvalError> {
    match heap.get_mut(port_ref)? {
        Cell::Port(p) => {
            p.open = false;
            Ok(())
        }
        other => Err(EvalError::WrongType {
            expected: "port",
            got: other.kind_name(),
        }),
    }
}

pub fn is_open(heap: &Heap, port_ref: Ref) -> Result<bool, EvalError> {
    match heap.get(port_ref)? {
        Cell::Port(p) => Ok(p.open),
        other => Err(EvalError::WrongType {
            expected: "port",
            got: other.kind_name(),
        }),
    }
}
