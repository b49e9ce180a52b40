//! The cell arena: allocation, mark-sweep reclamation, and the
//! marker-callback registry external roots use to keep their own referenced
//! cells alive across a sweep.

use crate::cell::Cell;
use crate::error::HeapError;
use std::fmt;

/// A handle to a heap-allocated cell — an index into the arena, never a raw
/// pointer, so the collector is free to compact or reuse slots underneath
/// callers holding a stale `Ref` (a use of one is a `HeapError::DanglingRef`,
/// not undefined behavior).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(u32);

impl Ref {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<ref {}>", self.0)
    }
}

enum Slot {
    Live(Cell),
    Free(u32),
}

const END_OF_FREELIST: u32 = u32::MAX;

/// A registered external root: called during the mark phase so that
/// owners of `Ref`s outside the heap itself (the three VM stacks, the
/// symbol table, an in-flight assembler's constant pool) get a chance to
/// keep their cells alive.
pub trait RootSource {
    fn roots(&self, out: &mut Vec<Ref>);
}

pub struct Heap {
    slots: Vec<Slot>,
    free_head: u32,
    live_count: usize,
    gc_block: usize,
    sweeps: u64,
    /// Transient per-sweep mark worklist, bump-allocated and reset every
    /// cycle rather than growing a `Vec` across collections.
    mark_scratch: bumpalo::Bump,
}

impl Heap {
    /// `gc_block` is how many additional slots a sweep grants before the
    /// next one is forced; it plays the role of the teacher's fixed arena
    /// block size, made a runtime parameter instead of a compile-time const.
    pub fn new(gc_block: usize) -> Self {
        let mut heap = Heap {
            slots: Vec::new(),
            free_head: END_OF_FREELIST,
            live_count: 0,
            gc_block: gc_block.max(16),
            sweeps: 0,
            mark_scratch: bumpalo::Bump::new(),
        };
        heap.grow(heap.gc_block);
        heap
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn sweep_count(&self) -> u64 {
        self.sweeps
    }

    fn grow(&mut self, additional: usize) {
        let start = self.slots.len();
        let end = start + additional;
        self.slots.reserve(additional);
        for i in start..end {
            let next = if i + 1 == end {
                self.free_head
            } else {
                (i + 1) as u32
            };
            self.slots.push(Slot::Free(next));
        }
        self.free_head = start as u32;
        tracing::debug!(added = additional, capacity = end, "heap grew");
    }

    /// Allocate `cell`, sweeping first if the free list is exhausted.
    /// `roots` supplies every external owner of live `Ref`s.
    pub fn alloc(&mut self, cell: Cell, roots: &[&dyn RootSource]) -> Result<Ref, HeapError> {
        if self.free_head == END_OF_FREELIST {
            self.sweep(roots);
        }
        if self.free_head == END_OF_FREELIST {
            self.grow(self.gc_block);
        }
        let index = self.free_head;
        let next = match &self.slots[index as usize] {
            Slot::Free(n) => *n,
            Slot::Live(_) => unreachable!("free list points at a live slot"),
        };
        self.free_head = next;
        self.slots[index as usize] = Slot::Live(cell);
        self.live_count += 1;
        Ok(Ref(index))
    }

    pub fn get(&self, r: Ref) -> Result<&Cell, HeapError> {
        match self.slots.get(r.index()) {
            Some(Slot::Live(cell)) => Ok(cell),
            _ => Err(HeapError::DanglingRef(r.index() as u32)),
        }
    }

    pub fn get_mut(&mut self, r: Ref) -> Result<&mut Cell, HeapError> {
        match self.slots.get_mut(r.index()) {
            Some(Slot::Live(cell)) => Ok(cell),
            _ => Err(HeapError::DanglingRef(r.index() as u32)),
        }
    }

    /// Mark-sweep reclamation: mark every cell reachable from `roots`
    /// (walking `Cell::for_each_child` transitively), then free every
    /// unmarked live slot.
    pub fn sweep(&mut self, roots: &[&dyn RootSource]) {
        self.sweeps += 1;
        let before = self.live_count;

        let mut marked = vec![false; self.slots.len()];
        let mut worklist: bumpalo::collections::Vec<'_, u32> =
            bumpalo::collections::Vec::new_in(&self.mark_scratch);

        for root in roots {
            let mut out = Vec::new();
            root.roots(&mut out);
            for r in out {
                if !marked[r.index()] {
                    marked[r.index()] = true;
                    worklist.push(r.index() as u32);
                }
            }
        }

        while let Some(idx) = worklist.pop() {
            if let Slot::Live(cell) = &self.slots[idx as usize] {
                let mut children = Vec::new();
                cell.for_each_child(|child| children.push(child));
                for child in children {
                    if !marked[child.index()] {
                        marked[child.index()] = true;
                        worklist.push(child.index() as u32);
                    }
                }
            }
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Live(_) = slot {
                if !marked[idx] {
                    *slot = Slot::Free(self.free_head);
                    self.free_head = idx as u32;
                    self.live_count -= 1;
                }
            }
        }

        self.mark_scratch.reset();
        tracing::debug!(
            reclaimed = before - self.live_count,
            live = self.live_count,
            sweep = self.sweeps,
            "heap sweep complete"
        );
    }
}
