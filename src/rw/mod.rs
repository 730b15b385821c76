//! Backpressure-free in-memory half-stream primitives (spec.md §4.1), each
//! with exactly one owner.

mod readable;
mod writable;

pub use readable::{channel, Readable, ReadableController, ReadableError, ReadableItem};
pub use writable::{WriteError, Writable};
