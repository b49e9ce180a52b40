//! Hand-rolled error types for the heap and stack layer.
//!
//! No `thiserror`/`anyhow` here, matching the teacher's own
//! `CodeGenError`-style errors: a plain enum with manual `Display`.

use std::error::Error;
use std::fmt;

/// Failures from the heap/allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// A sweep ran and the heap is still full.
    Exhausted { live_cells: usize, capacity: usize },
    /// A `Ref` did not point at a live cell (stale after a previous sweep,
    /// or simply out of range).
    DanglingRef(u32),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Exhausted {
                live_cells,
                capacity,
            } => write!(
                f,
                "heap exhausted after sweep: {live_cells} live cells, capacity {capacity}"
            ),
            HeapError::DanglingRef(idx) => write!(f, "dangling heap reference: {idx}"),
        }
    }
}

impl Error for HeapError {}

/// Failures from the three explicit VM stacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    Overflow { name: &'static str, capacity: usize },
    Underflow { name: &'static str },
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::Overflow { name, capacity } => {
                write!(f, "{name} overflow: capacity {capacity} exceeded")
            }
            StackError::Underflow { name } => write!(f, "{name} underflow: pop on empty stack"),
        }
    }
}

impl Error for StackError {}
