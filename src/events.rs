//! Events transports and sessions emit (spec.md §6).

use crate::id::SessionId;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connect,
    Disconnect,
    SessionGraceExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    HandshakeFailed,
    RetriesExceeded,
    MessageOrderingViolated,
    SessionStateMismatch,
    UseAfterDestroy,
}

#[derive(Debug, Clone)]
pub struct ProtocolErrorEvent {
    pub kind: ProtocolErrorKind,
    pub session_id: Option<SessionId>,
    pub message: String,
}

/// One event on a session's broadcast channel. Cheap to clone; consumers
/// that aren't listening simply miss events the way `tokio::sync::
/// broadcast` lagged receivers do, which matches the spec's "events,
/// not guaranteed delivery queues" framing.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connection(ConnectionStatus),
    Session(SessionStatus),
    Protocol(ProtocolErrorEvent),
}

/// A `tokio::sync::broadcast`-backed fan-out, the way
/// `matbeedotcom-remotemedia-sdk`'s pipeline runtime fans status updates
/// out to observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error: most sessions run headless.
        let _ = self.tx.send(event);
    }
}
