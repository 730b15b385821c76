//! The transport contract (spec.md §6). Out of scope per spec.md §1: the
//! concrete websocket/unix-socket/in-memory-pipe transport. What the core
//! needs is the shape below; [`in_memory_pair`] is the one concrete
//! implementation this crate carries, reserved for its own tests and
//! examples (grounded on the mock duplex `Transport` in
//! `carllerche-h2`'s `ping_pong` test module).

use crate::error::TransportError;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events a [`Connection`] reports out-of-band from its byte stream.
#[derive(Debug)]
pub enum ConnectionEvent {
    Data(Vec<u8>),
    Closed,
    Error(TransportError),
}

/// One established, message-oriented connection. A transport is
/// message-oriented if it delivers one logical envelope per `Data` event;
/// a stream-oriented transport (e.g. a raw TCP socket) is responsible for
/// its own length-prefixed framing before it ever reaches this trait.
pub trait Connection: Send + Sync {
    /// Sends one encoded envelope's bytes to the peer. Returns an error
    /// only for an already-closed connection; backpressure is the
    /// transport's problem, not the session's.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Closes this connection from the local side. Idempotent.
    fn close(&self);
}

/// Originates connections to a named peer.
pub trait Transport: Send + Sync {
    /// Connects to `peer`, returning a handle to send on and a channel of
    /// inbound events. The spec models this as synchronous-returning
    /// (`connect(peerId)→Connection`); the events channel is where actual
    /// async connect-latency and inbound data both surface.
    fn connect(&self, peer: &str) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>);
}

struct InMemoryConnection {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    closed: std::sync::atomic::AtomicBool,
}

impl Connection for InMemoryConnection {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(ConnectionEvent::Data(bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let _ = self.tx.send(ConnectionEvent::Closed);
    }
}

/// Builds a connected pair of in-memory [`Connection`]s: bytes sent on
/// one side arrive as `Data` events on the other. Used by this crate's
/// own integration tests to exercise the session/stream layers without a
/// real socket.
pub fn in_memory_pair() -> (
    (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>),
    (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>),
) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = Arc::new(InMemoryConnection {
        tx: a_tx,
        closed: std::sync::atomic::AtomicBool::new(false),
    }) as Arc<dyn Connection>;
    let b = Arc::new(InMemoryConnection {
        tx: b_tx,
        closed: std::sync::atomic::AtomicBool::new(false),
    }) as Arc<dyn Connection>;

    ((a, a_rx), (b, b_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pair_delivers_bytes() {
        let ((a, _a_rx), (_b, mut b_rx)) = in_memory_pair();
        a.send(b"hello".to_vec()).unwrap();
        match b_rx.recv().await.unwrap() {
            ConnectionEvent::Data(bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_notifies_the_peer() {
        let ((a, _a_rx), (_b, mut b_rx)) = in_memory_pair();
        a.close();
        assert!(matches!(b_rx.recv().await.unwrap(), ConnectionEvent::Closed));
    }
}
