//! The invoking side (spec.md §4.5): opens one of the four procedure
//! kinds against a remote peer and owns the reconnect loop. Grounded on
//! `carllerche-h2`'s `client::Connection`/`SendRequest` split, generalized
//! from "one HTTP/2 request" to "one of four procedure shapes", with the
//! reconnect policy carried over from `client::Builder`'s retry knobs.

use crate::backoff::{ExponentialBackoff, RetryBudget};
use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::control::ControlFlags;
use crate::envelope::{ControlPayload, Envelope, ExpectedSessionState, Payload};
use crate::error::{FerruleError, ProtocolError, SessionError};
use crate::events::{ProtocolErrorEvent, ProtocolErrorKind, SessionEvent};
use crate::id::{MessageId, PeerId, SessionId, StreamId};
use crate::proto::session::{Incoming, Session, SessionState};
use crate::proto::streams::stream::ProcedureKind;
use crate::result::{ErrorPayload, RpcResult};
use crate::rw::{Readable, ReadableError, WriteError, Writable};
use crate::schema::Schema;
use crate::transport::{Connection, ConnectionEvent, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct ReconnectState {
    budget: RetryBudget,
    backoff: ExponentialBackoff,
}

/// The subset of a [`crate::server::ProcedureDef`]'s schemas the client
/// mirrors for one procedure: what it validates on the values it
/// receives back (spec.md §6). Declared once, via
/// [`Client::declare_response_schema`], and enforced on every
/// subsequent call to that procedure.
#[derive(Clone)]
pub struct ResponseSchemas {
    pub data: Arc<dyn Schema>,
    pub error: Option<Arc<dyn Schema>>,
}

struct Inner {
    reconnect: Mutex<ReconnectState>,
    response_schemas: Mutex<HashMap<(String, String), ResponseSchemas>>,
}

/// One invoking peer's handle to a remote server (spec.md §3 "client").
/// Cheap to clone; every clone shares the same session and reconnect
/// state, the way [`Session`] itself is shared.
#[derive(Clone)]
pub struct Client {
    id: PeerId,
    remote: PeerId,
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,
    session: Session,
    inner: Arc<Inner>,
}

/// A running `upload`: write request chunks, then [`finalize`](Self::finalize)
/// to close the request half and await the terminal result.
pub struct UploadCall {
    pub stream_id: StreamId,
    pub req: Writable<Value>,
    res: Readable<Value, ErrorPayload>,
}

impl UploadCall {
    pub async fn finalize(mut self) -> RpcResult<Value> {
        self.req.close();
        read_terminal(&mut self.res).await
    }
}

/// A running bidirectional `stream`: write and read independently: the
/// response half can yield values before the request half closes.
pub struct StreamCall {
    pub stream_id: StreamId,
    pub req: Writable<Value>,
    pub res: Readable<Value, ErrorPayload>,
}

impl Client {
    pub fn new(
        id: impl Into<PeerId>,
        remote: impl Into<PeerId>,
        config: ClientConfig,
        codec: Arc<dyn Codec>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let id = id.into();
        let remote = remote.into();
        let session = Session::new(SessionId::generate(), id.clone(), remote.clone(), &config.session, codec.clone());
        let inner = Inner {
            reconnect: Mutex::new(ReconnectState {
                budget: RetryBudget::new(config.attempt_budget_capacity),
                backoff: ExponentialBackoff::new(config.backoff_base, config.backoff_max),
            }),
            response_schemas: Mutex::new(HashMap::new()),
        };
        Client {
            id,
            remote,
            config,
            codec,
            transport,
            session,
            inner: Arc::new(inner),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() == SessionState::Connected
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.session.events().subscribe()
    }

    /// Declares the `responseData`/`responseError` schemas this client
    /// enforces on values it receives back from `service.procedure`
    /// (spec.md §6). A procedure with no declaration goes unvalidated —
    /// the same as the server's `responseError` being optional.
    pub fn declare_response_schema(&self, service: &str, procedure: &str, schemas: ResponseSchemas) {
        self.inner
            .response_schemas
            .lock()
            .unwrap()
            .insert((service.to_string(), procedure.to_string()), schemas);
    }

    fn wire_response_schemas(&self, stream_id: StreamId, service: &str, procedure: &str) {
        let schemas = self
            .inner
            .response_schemas
            .lock()
            .unwrap()
            .get(&(service.to_string(), procedure.to_string()))
            .cloned();
        if let Some(schemas) = schemas {
            self.session.set_res_schemas(stream_id, schemas.data, schemas.error);
        }
    }

    /// Connects to the configured remote, completing the handshake
    /// before returning. A no-op if already connected.
    pub async fn connect(&self) -> Result<(), FerruleError> {
        if self.session.state() == SessionState::Connected {
            return Ok(());
        }
        let (conn, rx) = self.open_and_handshake().await?;
        self.session.attach(conn)?;
        self.spawn_reader(rx);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), FerruleError> {
        if self.session.state() == SessionState::Connected {
            return Ok(());
        }
        if !self.config.connect_on_invoke {
            return Err(ProtocolError::new(
                ProtocolErrorKind::HandshakeFailed,
                "not connected and connectOnInvoke is disabled",
            )
            .into());
        }
        self.connect().await
    }

    async fn open_and_handshake(
        &self,
    ) -> Result<(Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>), FerruleError> {
        let (conn, mut rx) = self.transport.connect(&self.remote);

        let req = Envelope {
            id: MessageId::generate(),
            from: self.id.clone(),
            to: self.remote.clone(),
            seq: 0,
            ack: 0,
            stream_id: StreamId::generate(),
            control_flags: ControlFlags::NONE,
            service_name: None,
            procedure_name: None,
            tracing: None,
            payload: Payload::Control(ControlPayload::HandshakeReq {
                protocol_version: self.config.session.protocol_version.clone(),
                session_id: self.session.id,
                expected_session_state: ExpectedSessionState {
                    next_expected_seq: self.session.next_expected_seq(),
                    next_sent_seq: self.session.next_sent_seq(),
                },
                metadata: None,
            }),
        };
        let bytes = self.codec.encode(&req).map_err(SessionError::Codec)?;
        conn.send(bytes).map_err(SessionError::Transport)?;

        let resp_bytes = loop {
            match rx.recv().await {
                Some(ConnectionEvent::Data(bytes)) => break bytes,
                Some(ConnectionEvent::Closed) | None => {
                    return Err(ProtocolError::new(
                        ProtocolErrorKind::HandshakeFailed,
                        "connection closed before a handshake response arrived",
                    )
                    .into());
                }
                Some(ConnectionEvent::Error(err)) => return Err(SessionError::Transport(err).into()),
            }
        };
        let resp = self
            .codec
            .decode(&resp_bytes)
            .map_err(SessionError::Codec)?
            .ok_or_else(|| ProtocolError::new(ProtocolErrorKind::HandshakeFailed, "empty handshake response"))?;

        match resp.payload {
            Payload::Control(ControlPayload::HandshakeResp { ok: true, .. }) => Ok((conn, rx)),
            Payload::Control(ControlPayload::HandshakeResp { ok: false, reason, .. }) => Err(ProtocolError::new(
                ProtocolErrorKind::HandshakeFailed,
                reason.unwrap_or_else(|| "server rejected the handshake".to_string()),
            )
            .into()),
            _ => Err(ProtocolError::new(
                ProtocolErrorKind::HandshakeFailed,
                "first frame from server was not HANDSHAKE_RESP",
            )
            .into()),
        }
    }

    fn spawn_reader(&self, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(this.session.heartbeat_interval());
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(ConnectionEvent::Data(bytes)) => {
                                if !this.on_bytes(&bytes) {
                                    this.on_disconnect();
                                    break;
                                }
                            }
                            Some(ConnectionEvent::Closed) | None => {
                                this.on_disconnect();
                                break;
                            }
                            Some(ConnectionEvent::Error(err)) => {
                                tracing::warn!(%err, "transport error");
                                this.on_disconnect();
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if this.session.heartbeat_missed() {
                            tracing::warn!(session_id = %this.session.id, "heartbeat missed threshold, dropping connection");
                            this.on_disconnect();
                            break;
                        }
                        let _ = this.session.send(
                            StreamId::generate(),
                            ControlFlags::NONE,
                            None,
                            None,
                            Payload::Control(ControlPayload::Ack),
                        );
                    }
                }
            }
        });
    }

    /// Returns `false` if the connection must be dropped.
    fn on_bytes(&self, bytes: &[u8]) -> bool {
        let incoming = match self.session.receive_bytes(bytes) {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return true,
            Err(FerruleError::Protocol(err)) => {
                tracing::warn!(session_id = %self.session.id, %err, "protocol error, dropping connection");
                self.session.events().emit(SessionEvent::Protocol(ProtocolErrorEvent {
                    kind: err.kind,
                    session_id: Some(self.session.id),
                    message: err.message,
                }));
                return false;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to process inbound frame");
                return true;
            }
        };

        match incoming {
            Incoming::Control(ControlPayload::Close) => false,
            Incoming::Control(_) => true,
            Incoming::Delivered | Incoming::Discarded => true,
            Incoming::NeedsOpen(envelope) => {
                tracing::warn!(stream_id = %envelope.stream_id, "server opened a stream the client never requested, discarding");
                true
            }
        }
    }

    fn on_disconnect(&self) {
        self.session.detach();
        if !self.config.reconnect_on_connection_drop {
            self.schedule_grace();
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    fn schedule_grace(&self) {
        let this = self.clone();
        let grace = this.config.session.session_disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.session.state() == SessionState::NoConnection {
                this.session.expire();
            }
        });
    }

    async fn reconnect_loop(&self) {
        loop {
            let delay = self.inner.reconnect.lock().unwrap().backoff.next_delay();
            tokio::time::sleep(delay).await;

            match self.open_and_handshake().await {
                Ok((conn, rx)) => {
                    {
                        let mut state = self.inner.reconnect.lock().unwrap();
                        state.backoff.reset();
                        state.budget.refill();
                    }
                    let from_seq = self
                        .session
                        .retained_from_seq()
                        .unwrap_or_else(|| self.session.next_sent_seq());
                    if self.session.resume(from_seq, conn).is_ok() {
                        self.spawn_reader(rx);
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "reconnect attempt failed");
                    let exhausted = !self.inner.reconnect.lock().unwrap().budget.try_consume();
                    if exhausted {
                        self.session.events().emit(SessionEvent::Protocol(ProtocolErrorEvent {
                            kind: ProtocolErrorKind::RetriesExceeded,
                            session_id: Some(self.session.id),
                            message: "reconnect retry budget exhausted".to_string(),
                        }));
                        self.schedule_grace();
                        return;
                    }
                }
            }
        }
    }

    /// Calls an `rpc` procedure: one request, one terminal result.
    pub async fn call_rpc(&self, service: &str, procedure: &str, req_init: Value) -> RpcResult<Value> {
        if let Err(err) = self.ensure_connected().await {
            return RpcResult::Err(ErrorPayload::new("CONNECT_FAILED", err.to_string()));
        }

        let stream_id = StreamId::generate();
        self.session
            .open_stream(stream_id, ProcedureKind::Rpc, service.to_string(), procedure.to_string());
        self.wire_response_schemas(stream_id, service, procedure);
        let mut res = self.session.register_res_sink(stream_id);

        if let Err(err) = self.open_with_init(stream_id, service, procedure, req_init, true) {
            return RpcResult::Err(ErrorPayload::new("SEND_FAILED", err.to_string()));
        }

        read_terminal(&mut res).await
    }

    /// Calls an `upload` procedure: a stream of request chunks, one
    /// terminal result observed through [`UploadCall::finalize`].
    pub async fn call_upload(
        &self,
        service: &str,
        procedure: &str,
        req_init: Value,
    ) -> Result<UploadCall, FerruleError> {
        self.ensure_connected().await?;

        let stream_id = StreamId::generate();
        self.session
            .open_stream(stream_id, ProcedureKind::Upload, service.to_string(), procedure.to_string());
        self.wire_response_schemas(stream_id, service, procedure);
        let res = self.session.register_res_sink(stream_id);
        self.open_with_init(stream_id, service, procedure, req_init, false)?;

        Ok(UploadCall {
            stream_id,
            req: self.make_request_writable(stream_id),
            res,
        })
    }

    /// Calls a `subscription` procedure: a one-shot request, a stream of
    /// response values with no terminal value.
    pub async fn call_subscription(
        &self,
        service: &str,
        procedure: &str,
        req_init: Value,
    ) -> Result<Readable<Value, ErrorPayload>, FerruleError> {
        self.ensure_connected().await?;

        let stream_id = StreamId::generate();
        self.session.open_stream(
            stream_id,
            ProcedureKind::Subscription,
            service.to_string(),
            procedure.to_string(),
        );
        self.wire_response_schemas(stream_id, service, procedure);
        let res = self.session.register_res_sink(stream_id);
        self.open_with_init(stream_id, service, procedure, req_init, true)?;

        Ok(res)
    }

    /// Calls a `stream` procedure: independent request and response
    /// halves, each closing on its own schedule.
    pub async fn call_stream(
        &self,
        service: &str,
        procedure: &str,
        req_init: Value,
    ) -> Result<StreamCall, FerruleError> {
        self.ensure_connected().await?;

        let stream_id = StreamId::generate();
        self.session
            .open_stream(stream_id, ProcedureKind::Stream, service.to_string(), procedure.to_string());
        self.wire_response_schemas(stream_id, service, procedure);
        let res = self.session.register_res_sink(stream_id);
        self.open_with_init(stream_id, service, procedure, req_init, false)?;

        Ok(StreamCall {
            stream_id,
            req: self.make_request_writable(stream_id),
            res,
        })
    }

    /// Sends the open frame carrying `req_init`. `close_request_half`
    /// also marks the local half closed for kinds that never write
    /// request data (`rpc`/`subscription`); it rides on this one frame
    /// rather than a separate `StreamClosed` round-trip.
    fn open_with_init(
        &self,
        stream_id: StreamId,
        service: &str,
        procedure: &str,
        req_init: Value,
        close_request_half: bool,
    ) -> Result<(), FerruleError> {
        let mut flags = ControlFlags::STREAM_OPEN;
        if close_request_half {
            flags |= ControlFlags::STREAM_CLOSED;
        }
        self.session.send(
            stream_id,
            flags,
            Some(service.to_string()),
            Some(procedure.to_string()),
            Payload::Data(req_init),
        )?;
        if close_request_half {
            self.session.mark_local_closed(stream_id);
        }
        Ok(())
    }

    fn make_request_writable(&self, stream_id: StreamId) -> Writable<Value> {
        let session_for_write = self.session.clone();
        let session_for_close = self.session.clone();
        Writable::new(
            move |value: Value| {
                session_for_write
                    .send(stream_id, ControlFlags::NONE, None, None, Payload::Data(value))
                    .map_err(|_| WriteError::Closed)
            },
            move || {
                let _ = session_for_close.close_local(stream_id, ControlFlags::NONE, Payload::Data(Value::Null));
            },
        )
    }

    /// Aborts a running call from the client side (spec.md §4.5
    /// "cancellation propagates as an abort").
    pub fn cancel(&self, stream_id: StreamId, reason: impl Into<String>) {
        let _ = self.session.abort_stream(stream_id, ErrorPayload::abort(reason));
    }
}

async fn read_terminal(res: &mut Readable<Value, ErrorPayload>) -> RpcResult<Value> {
    match res.next().await {
        Some(Ok(value)) => RpcResult::Ok(value),
        Some(Err(ReadableError::Application(err))) => RpcResult::Err(err),
        Some(Err(ReadableError::Broken)) | None => RpcResult::Err(ErrorPayload::readable_broken()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::transport::in_memory_pair;

    struct PairTransport {
        conn: Arc<dyn Connection>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    }

    impl Transport for PairTransport {
        fn connect(&self, _peer: &str) -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
            let rx = self.rx.lock().unwrap().take().expect("connect called more than once in this test");
            (self.conn.clone(), rx)
        }
    }

    #[tokio::test]
    async fn connect_completes_the_handshake() {
        let ((client_conn, client_rx), (server_conn, mut server_rx)) = in_memory_pair();
        let transport = Arc::new(PairTransport {
            conn: client_conn,
            rx: Mutex::new(Some(client_rx)),
        });
        let client = Client::new(
            "client",
            "server",
            ClientConfig::default(),
            Arc::new(JsonCodec::default()),
            transport,
        );

        let server_side = tokio::spawn(async move {
            let bytes = match server_rx.recv().await.unwrap() {
                ConnectionEvent::Data(b) => b,
                other => panic!("unexpected: {other:?}"),
            };
            let codec = JsonCodec::default();
            let req = codec.decode(&bytes).unwrap().unwrap();
            let session_id = match req.payload {
                Payload::Control(ControlPayload::HandshakeReq { session_id, .. }) => session_id,
                other => panic!("unexpected payload: {other:?}"),
            };
            let resp = Envelope {
                id: MessageId::generate(),
                from: "server".into(),
                to: "client".into(),
                seq: 0,
                ack: 0,
                stream_id: StreamId::generate(),
                control_flags: ControlFlags::NONE,
                service_name: None,
                procedure_name: None,
                tracing: None,
                payload: Payload::Control(ControlPayload::HandshakeResp {
                    ok: true,
                    session_id,
                    reason: None,
                }),
            };
            server_conn.send(codec.encode(&resp).unwrap()).unwrap();
        });

        client.connect().await.unwrap();
        server_side.await.unwrap();
        assert_eq!(client.session.state(), SessionState::Connected);
    }
}
