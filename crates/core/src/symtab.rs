//! Append-only symbol interning. Two symbols with the same spelling are
//! `eq?` exactly when they resolve to the same `Ref`, so `eq?`/`eqv?` on
//! symbols is plain `Ref` equality once interned.

use crate::cell::{Cell, SymbolCell};
use crate::error::HeapError;
use crate::heap::{Heap, Ref, RootSource};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<Rc<str>, Ref>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Look up or create the symbol cell for `name`. A freshly-created
    /// symbol's binding slot is allocated as `Cell::Unbound`; its plist
    /// starts out pointing at the caller's canonical `null` cell, so the
    /// "exactly one canonical null" invariant holds even for symbol
    /// property lists.
    pub fn intern(
        &mut self,
        heap: &mut Heap,
        name: &str,
        null: Ref,
        roots: &[&dyn RootSource],
    ) -> Result<Ref, HeapError> {
        if let Some(r) = self.by_name.get(name) {
            return Ok(*r);
        }
        let binding = heap.alloc(Cell::Unbound, roots)?;
        let plist = null;
        let name: Rc<str> = Rc::from(name);
        let symbol = heap.alloc(
            Cell::Symbol(SymbolCell {
                name: name.clone(),
                binding,
                plist,
            }),
            roots,
        )?;
        self.by_name.insert(name, symbol);
        Ok(symbol)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl RootSource for SymbolTable {
    fn roots(&self, out: &mut Vec<Ref>) {
        out.extend(self.by_name.values().copied());
    }
}
