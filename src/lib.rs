//! A schema-typed RPC core multiplexing `rpc`/`upload`/`subscription`/
//! `stream` procedures over one resumable session (spec.md §1-§3).
//!
//! The crate is transport- and schema-agnostic: [`transport::Transport`]
//! and [`schema::Schema`] are the two seams an embedder fills in, the way
//! `carllerche-h2` leaves I/O and HPACK's dictionary to its caller while
//! owning the stream multiplexing itself. [`server::Server`] accepts
//! connections and dispatches to registered [`server::ProcedureDef`]s;
//! [`client::Client`] originates calls and owns the reconnect loop.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod envelope;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod id;
pub mod proto;
pub mod result;
pub mod rw;
pub mod schema;
pub mod server;
pub mod transport;

pub use client::Client;
pub use error::FerruleError;
pub use result::{ErrorPayload, RpcResult};
pub use server::Server;
