pub mod store;
pub mod stream;
pub mod streams;

pub use store::Key;
pub use stream::{CleanupStack, ProcedureKind, StreamEntry, StreamState};
pub use streams::{Routed, Streams};
