//! Layered error taxonomy. Transport/codec/session/stream errors each get
//! their own enum and bridge into [`FerruleError`] via `#[from]`, the way
//! h2 threads `RecvError`/`SendError` up through `proto::Error`.

use crate::events::ProtocolErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport io error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema validation failed: {0}")]
    Invalid(String),
}

/// Errors a session's send path can report synchronously. Disconnection
/// is not an error here: the spec requires sends to queue while
/// disconnected, not fail.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} has already been destroyed")]
    Destroyed(crate::id::SessionId),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream {0} is not open")]
    NotOpen(crate::id::StreamId),
    #[error("stream {0} was aborted")]
    Aborted(crate::id::StreamId),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A protocol-level failure: not user-visible via an `RpcResult`, but
/// surfaced as a [`crate::events::ProtocolError`] event and always
/// followed by the underlying transport connection being dropped.
#[derive(Debug, Error)]
#[error("protocol error: {kind:?}: {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        ProtocolError {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FerruleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
