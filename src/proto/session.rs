//! The session state machine (spec.md §4.3): handshake-negotiated
//! identity, seq/ack bookkeeping, send buffering, and the streams it
//! owns. Grounded on `carllerche-h2`'s `proto::Connection` /
//! `proto::streams::Streams`, which share exactly this shape — one
//! `Arc<Mutex<Inner>>` mutated only for the duration of a synchronous
//! transition, never across an `.await`.

use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::control::ControlFlags;
use crate::envelope::{ControlPayload, Envelope, Payload};
use crate::error::{FerruleError, ProtocolError, SessionError};
use crate::events::{ConnectionStatus, EventBus, ProtocolErrorEvent, ProtocolErrorKind, SessionEvent, SessionStatus};
use crate::heartbeat::HeartbeatMonitor;
use crate::id::{MessageId, PeerId, SessionId, StreamId};
use crate::proto::streams::stream::ProcedureKind;
use crate::proto::streams::streams::{Routed, Streams};
use crate::result::ErrorPayload;
use crate::rw::{channel, Readable, ReadableController};
use crate::schema::Schema;
use crate::transport::Connection;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoConnection,
    Connecting,
    Handshaking,
    Connected,
    PendingIdentification,
    /// The grace period elapsed with no reconnect; every stream was
    /// aborted and the session will never accept another send or open.
    Destroyed,
}

/// What happened to one inbound envelope once session-level bookkeeping
/// (seq check, ack pruning, heartbeat) has run.
#[derive(Debug)]
pub enum Incoming {
    /// A control envelope (`HANDSHAKE_REQ`/`HANDSHAKE_RESP`/`CLOSE`); the
    /// driver loop owns handshake/session-registry decisions this module
    /// can't make on its own.
    Control(ControlPayload),
    /// A new stream open frame with no existing entry; validate, then
    /// call [`Session::open_stream`], register sinks, and finally
    /// [`Session::route`] the same envelope.
    NeedsOpen(Envelope),
    /// Delivered into an existing stream's local sink.
    Delivered,
    /// Frame for an unknown or tombstoned stream; silently discarded.
    Discarded,
}

struct Inner {
    state: SessionState,
    next_sent_seq: u64,
    next_expected_seq: u64,
    send_buffer: VecDeque<Envelope>,
    send_queue: VecDeque<Envelope>,
    streams: Streams,
    heartbeat: HeartbeatMonitor,
    connection: Option<Arc<dyn Connection>>,
}

/// A persistent logical channel to one remote peer, surviving transport
/// reconnects (spec.md §3 "Session"). Cheap to clone; clones share the
/// same underlying state.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub from: PeerId,
    pub to: PeerId,
    codec: Arc<dyn Codec>,
    events: EventBus,
    inner: Arc<Mutex<Inner>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        config: &SessionConfig,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Session {
            id,
            from: from.into(),
            to: to.into(),
            codec,
            events: EventBus::new(),
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::NoConnection,
                next_sent_seq: 0,
                next_expected_seq: 0,
                send_buffer: VecDeque::new(),
                send_queue: VecDeque::new(),
                streams: Streams::new(),
                heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.heartbeats_until_dead),
                connection: None,
            })),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn next_sent_seq(&self) -> u64 {
        self.inner.lock().unwrap().next_sent_seq
    }

    pub fn next_expected_seq(&self) -> u64 {
        self.inner.lock().unwrap().next_expected_seq
    }

    /// The lowest `seq` still retained in the send buffer, i.e. the
    /// earliest point a resuming peer's `nextExpectedSeq` could still be
    /// satisfied from. `None` if the buffer is empty (fully acked).
    pub fn retained_from_seq(&self) -> Option<u64> {
        self.inner.lock().unwrap().send_buffer.front().map(|e| e.seq)
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.inner.lock().unwrap().heartbeat.interval()
    }

    /// Attaches a freshly connected transport: flushes anything queued
    /// while disconnected, enters `Connected`, and resets heartbeat
    /// misses. Idempotent against a stale `Some` left by a prior attach.
    pub fn attach(&self, connection: Arc<dyn Connection>) -> Result<(), FerruleError> {
        let mut to_flush = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connection = Some(connection.clone());
            inner.state = SessionState::Connected;
            inner.heartbeat.record_activity();
            to_flush.extend(inner.send_queue.drain(..));
        }
        for envelope in to_flush {
            let bytes = self
                .codec
                .encode(&envelope)
                .map_err(SessionError::Codec)?;
            connection.send(bytes).map_err(SessionError::Transport)?;
        }
        self.events.emit(SessionEvent::Connection(ConnectionStatus::Connect));
        self.events.emit(SessionEvent::Session(SessionStatus::Connect));
        Ok(())
    }

    /// Resumes onto a new transport after a reconnect: drops
    /// already-acked frames below `from_seq` from the retained send
    /// buffer, then replays the rest ahead of anything queued while
    /// disconnected, preserving their original `seq`/`ack` (spec.md
    /// §4.3 "resume, drop acked frames from the buffer, replay the
    /// rest").
    pub fn resume(&self, from_seq: u64, connection: Arc<dyn Connection>) -> Result<(), FerruleError> {
        let replay: Vec<Envelope> = {
            let mut inner = self.inner.lock().unwrap();
            while matches!(inner.send_buffer.front(), Some(e) if e.seq < from_seq) {
                inner.send_buffer.pop_front();
            }
            let mut replay: Vec<Envelope> = inner.send_buffer.iter().cloned().collect();
            replay.extend(inner.send_queue.drain(..));
            inner.connection = Some(connection.clone());
            inner.state = SessionState::Connected;
            inner.heartbeat.record_activity();
            replay
        };
        for envelope in replay {
            let bytes = self.codec.encode(&envelope).map_err(SessionError::Codec)?;
            connection.send(bytes).map_err(SessionError::Transport)?;
        }
        self.events.emit(SessionEvent::Connection(ConnectionStatus::Connect));
        self.events.emit(SessionEvent::Session(SessionStatus::Connect));
        Ok(())
    }

    /// Detaches the current transport (drop, ordering violation, or
    /// explicit close) without destroying the session. Streams remain
    /// open; sends now queue until the next [`attach`](Self::attach) or
    /// until [`expire`](Self::expire) tears them down.
    pub fn detach(&self) {
        let was_connected = {
            let mut inner = self.inner.lock().unwrap();
            let was = inner.connection.take().is_some();
            inner.state = SessionState::NoConnection;
            was
        };
        if was_connected {
            self.events.emit(SessionEvent::Connection(ConnectionStatus::Disconnect));
            self.events.emit(SessionEvent::Session(SessionStatus::Disconnect));
        }
    }

    /// Called once the grace period elapses with no reconnect: aborts
    /// every live stream with `UNEXPECTED_DISCONNECT` (spec.md §7) and
    /// emits `sessionGraceExpired`.
    pub fn expire(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.streams.abort_all(&ErrorPayload::unexpected_disconnect());
        inner.state = SessionState::Destroyed;
        drop(inner);
        self.events.emit(SessionEvent::Session(SessionStatus::SessionGraceExpired));
    }

    /// Emits `UseAfterDestroy` and fails the call if the session's grace
    /// period already elapsed (spec.md §4.3/§5: a destroyed session must
    /// refuse further sends or opens rather than resurrect state).
    fn reject_if_destroyed(&self, what: &str) -> Result<(), FerruleError> {
        if self.inner.lock().unwrap().state != SessionState::Destroyed {
            return Ok(());
        }
        let message = format!("{what} called on a destroyed session");
        tracing::warn!(session_id = %self.id, %message);
        self.events.emit(SessionEvent::Protocol(ProtocolErrorEvent {
            kind: ProtocolErrorKind::UseAfterDestroy,
            session_id: Some(self.id),
            message: message.clone(),
        }));
        Err(ProtocolError::new(ProtocolErrorKind::UseAfterDestroy, message).into())
    }

    /// Builds and sends one envelope, stamping `id`/`seq`/`ack`. Queues
    /// rather than failing while disconnected (spec.md §4.3 send path).
    pub fn send(
        &self,
        stream_id: StreamId,
        control_flags: ControlFlags,
        service_name: Option<String>,
        procedure_name: Option<String>,
        payload: Payload,
    ) -> Result<(), FerruleError> {
        self.reject_if_destroyed("send")?;
        let envelope = Envelope {
            id: MessageId::generate(),
            from: self.from.clone(),
            to: self.to.clone(),
            seq: 0,
            ack: 0,
            stream_id,
            control_flags,
            service_name,
            procedure_name,
            tracing: None,
            payload,
        };
        self.send_envelope(envelope)
    }

    fn send_envelope(&self, mut envelope: Envelope) -> Result<(), FerruleError> {
        let ready_connection = {
            let mut inner = self.inner.lock().unwrap();
            envelope.seq = inner.next_sent_seq;
            inner.next_sent_seq += 1;
            envelope.ack = inner.next_expected_seq;
            inner.send_buffer.push_back(envelope.clone());

            match &inner.connection {
                Some(conn) if inner.state == SessionState::Connected => Some(conn.clone()),
                _ => {
                    inner.send_queue.push_back(envelope.clone());
                    None
                }
            }
        };

        if let Some(conn) = ready_connection {
            let bytes = self.codec.encode(&envelope).map_err(SessionError::Codec)?;
            conn.send(bytes).map_err(SessionError::Transport)?;
        }
        Ok(())
    }

    /// Decodes and routes one inbound frame (spec.md §4.3 receive path,
    /// steps 1–4). A [`ProtocolError`] means the caller must drop the
    /// transport connection (via [`detach`](Self::detach)) but keep the
    /// session alive for a future resumption.
    pub fn receive_bytes(&self, bytes: &[u8]) -> Result<Option<Incoming>, FerruleError> {
        let envelope = self.codec.decode(bytes).map_err(SessionError::Codec)?;
        match envelope {
            Some(envelope) => self.receive(envelope).map(Some),
            None => Ok(None),
        }
    }

    pub fn receive(&self, envelope: Envelope) -> Result<Incoming, FerruleError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if envelope.seq != inner.next_expected_seq {
                return Err(ProtocolError::new(
                    ProtocolErrorKind::MessageOrderingViolated,
                    format!(
                        "expected seq {}, got {}",
                        inner.next_expected_seq, envelope.seq
                    ),
                )
                .into());
            }
            inner.next_expected_seq += 1;
            while let Some(front) = inner.send_buffer.front() {
                if front.seq <= envelope.ack {
                    inner.send_buffer.pop_front();
                } else {
                    break;
                }
            }
            inner.heartbeat.record_activity();
        }

        if let Payload::Control(cp) = &envelope.payload {
            return Ok(Incoming::Control(cp.clone()));
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.streams.route(&envelope) {
            Routed::NeedsOpen => Ok(Incoming::NeedsOpen(envelope)),
            Routed::Delivered => Ok(Incoming::Delivered),
            Routed::Discarded => Ok(Incoming::Discarded),
        }
    }

    /// Records a heartbeat tick with no intervening inbound activity.
    /// Returns `true` once the connection should be considered dead.
    pub fn heartbeat_missed(&self) -> bool {
        self.inner.lock().unwrap().heartbeat.record_miss()
    }

    /// Inserts a brand-new stream, either locally originated (client
    /// invoking a procedure) or accepted from a validated remote open.
    pub fn open_stream(
        &self,
        id: StreamId,
        kind: ProcedureKind,
        service_name: String,
        procedure_name: String,
    ) {
        if self.reject_if_destroyed("open_stream").is_err() {
            return;
        }
        self.inner.lock().unwrap().streams.insert(id, kind, service_name, procedure_name);
    }

    /// Routes an envelope against an already-inserted stream (used by
    /// [`Incoming::NeedsOpen`] handling, after the caller has validated
    /// the open and registered sinks via [`open_stream`](Self::open_stream)
    /// / [`register_req_sink`](Self::register_req_sink) /
    /// [`register_res_sink`](Self::register_res_sink), in that order, so
    /// the sinks exist before this delivers the open frame's payload).
    pub fn route(&self, envelope: &Envelope) -> Routed {
        self.inner.lock().unwrap().streams.route(envelope)
    }

    /// Registers a reader for the request half (server-side, `upload`/
    /// `stream`) and returns the `Readable` applications iterate.
    pub fn register_req_sink(&self, id: StreamId) -> Readable<Value, ErrorPayload> {
        let (readable, ctrl) = channel();
        self.set_req_sink(id, ctrl);
        readable
    }

    /// Registers a reader for the response half (client-side, any kind).
    pub fn register_res_sink(&self, id: StreamId) -> Readable<Value, ErrorPayload> {
        let (readable, ctrl) = channel();
        self.set_res_sink(id, ctrl);
        readable
    }

    fn set_req_sink(&self, id: StreamId, ctrl: ReadableController<Value, ErrorPayload>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.streams.find(&id) {
            if let Some(entry) = inner.streams.get_mut(key) {
                entry.req_sink = Some(ctrl);
            }
        }
    }

    fn set_res_sink(&self, id: StreamId, ctrl: ReadableController<Value, ErrorPayload>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.streams.find(&id) {
            if let Some(entry) = inner.streams.get_mut(key) {
                entry.res_sink = Some(ctrl);
            }
        }
    }

    /// Installs the `requestData` schema this stream's server-side
    /// request half enforces on values as they arrive (spec.md §6).
    pub fn set_req_data_schema(&self, id: StreamId, schema: Arc<dyn Schema>) {
        self.inner.lock().unwrap().streams.set_req_data_schema(id, schema);
    }

    /// Installs the `responseData`/`responseError` schemas this stream's
    /// client-side response half enforces on values as they arrive.
    pub fn set_res_schemas(&self, id: StreamId, data: Arc<dyn Schema>, error: Option<Arc<dyn Schema>>) {
        self.inner.lock().unwrap().streams.set_res_schemas(id, data, error);
    }

    /// Registers the framework-internal teardown hook fired once when
    /// the stream aborts or fully closes, before its cleanup stack runs.
    pub fn set_on_teardown(&self, id: StreamId, teardown: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.streams.find(&id) {
            if let Some(entry) = inner.streams.get_mut(key) {
                entry.on_teardown = Some(Box::new(teardown));
            }
        }
    }

    pub fn defer_cleanup(&self, id: StreamId, cleanup: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.streams.find(&id) {
            if let Some(entry) = inner.streams.get_mut(key) {
                entry.cleanup.defer(cleanup);
            }
        }
    }

    pub fn stream_kind(&self, id: StreamId) -> Option<ProcedureKind> {
        let inner = self.inner.lock().unwrap();
        inner.streams.find(&id).and_then(|key| inner.streams.get(key)).map(|e| e.kind)
    }

    /// Sends a `StreamClosed` frame for the local half and updates local
    /// bookkeeping to match (spec.md §4.4 half-close flow).
    pub fn close_local(
        &self,
        id: StreamId,
        extra_flags: ControlFlags,
        payload: Payload,
    ) -> Result<(), FerruleError> {
        self.send(id, extra_flags | ControlFlags::STREAM_CLOSED, None, None, payload)?;
        self.inner.lock().unwrap().streams.close_local_by_id(id);
        Ok(())
    }

    /// Marks the local half closed without sending a frame — for a
    /// caller that already set `StreamClosed` on a frame it sent via
    /// [`send`](Self::send) directly (an `rpc`/`subscription` open frame
    /// closes the request half the same way).
    pub fn mark_local_closed(&self, id: StreamId) {
        self.inner.lock().unwrap().streams.close_local_by_id(id);
    }

    /// Aborts a stream from the local side: updates bookkeeping, then
    /// sends the wire `StreamAbort` frame carrying `error`.
    pub fn abort_stream(&self, id: StreamId, error: ErrorPayload) -> Result<(), FerruleError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.streams.abort_local_by_id(id, &error);
        }
        self.send(
            id,
            ControlFlags::STREAM_ABORT,
            None,
            None,
            Payload::Result(crate::result::RpcResult::Err(error)),
        )
    }
}
