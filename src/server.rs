//! Server dispatch and the handler runtime (spec.md §4.6): routes
//! validated opens to registered procedures, drives the per-kind
//! handler, and contains uncaught errors. Grounded on `carllerche-h2`'s
//! `server::Connection`, generalized from "accept one HTTP/2 stream,
//! call a `tower::Service`" to "accept one procedure open, call a
//! per-kind `Handler`".

use crate::config::ServerConfig;
use crate::control::ControlFlags;
use crate::envelope::{ControlPayload, Envelope, ExpectedSessionState, Payload};
use crate::error::FerruleError;
use crate::events::{EventBus, ProtocolErrorEvent, ProtocolErrorKind, SessionEvent};
use crate::id::{PeerId, SessionId, StreamId};
use crate::proto::handshake::{self, Decision, HandshakeRequest};
use crate::proto::session::{Incoming, Session};
use crate::proto::streams::stream::ProcedureKind;
use crate::result::{ErrorPayload, RpcResult};
use crate::rw::{Readable, WriteError, Writable};
use crate::schema::{Schema, ValidationMode};
use crate::transport::{Connection, ConnectionEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The outcome a [`Handler`] produces: `rpc`/`upload` return the
/// terminal [`RpcResult`] the framework sends and closes with;
/// `subscription`/`stream` return `Void` because their response half's
/// lifetime is governed by the handler closing its own `Writable`
/// (spec.md §9 "handler return vs. writer close").
pub enum HandlerOutcome {
    Result(RpcResult<Value>),
    Void,
}

/// Per-kind handler input (spec.md §6 handler signature table).
pub enum HandlerArgs {
    Rpc { req_init: Value },
    Upload { req_init: Value, req: Readable<Value, ErrorPayload> },
    Subscription { req_init: Value, res: Writable<Value> },
    Stream {
        req_init: Value,
        req: Readable<Value, ErrorPayload>,
        res: Writable<Value>,
    },
}

/// A fires-once-latches-forever cancellation signal: the client aborted
/// this stream, or the session disconnected without resumption. Backed
/// by `tokio::sync::watch` rather than `Notify` so a handler that checks
/// after the fact still observes it (Notify's wake is lost to late
/// subscribers).
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves immediately if already cancelled, else waits for it.
    pub async fn cancelled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Exposed to a handler for one procedure invocation (spec.md §4.6).
pub struct ProcedureHandlerContext {
    pub session_id: SessionId,
    pub remote_peer_id: PeerId,
    pub metadata: Option<Value>,
    pub signal: CancelSignal,
    session: Session,
    stream_id: StreamId,
}

impl ProcedureHandlerContext {
    /// Ends the stream from the handler side with `reason`, sent as a
    /// server-originated `StreamAbort` (spec.md §4.6 `ctx.cancel`).
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Err(err) = self.session.abort_stream(self.stream_id, ErrorPayload::abort(reason)) {
            tracing::warn!(stream_id = %self.stream_id, %err, "failed to send ctx.cancel abort");
        }
    }

    /// Registers a callback run once the stream fully closes, in LIFO
    /// order relative to other deferred cleanups (spec.md §4.4).
    pub fn defer_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.session.defer_cleanup(self.stream_id, cleanup);
    }
}

pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: ProcedureHandlerContext, args: HandlerArgs) -> BoxFuture<HandlerOutcome>;
}

struct RpcFn<F>(F);
impl<F, Fut> Handler for RpcFn<F>
where
    F: Fn(ProcedureHandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    fn call(&self, ctx: ProcedureHandlerContext, args: HandlerArgs) -> BoxFuture<HandlerOutcome> {
        let HandlerArgs::Rpc { req_init } = args else {
            unreachable!("RpcFn only ever receives HandlerArgs::Rpc")
        };
        let fut = (self.0)(ctx, req_init);
        Box::pin(async move { HandlerOutcome::Result(fut.await) })
    }
}

struct UploadFn<F>(F);
impl<F, Fut> Handler for UploadFn<F>
where
    F: Fn(ProcedureHandlerContext, Value, Readable<Value, ErrorPayload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    fn call(&self, ctx: ProcedureHandlerContext, args: HandlerArgs) -> BoxFuture<HandlerOutcome> {
        let HandlerArgs::Upload { req_init, req } = args else {
            unreachable!("UploadFn only ever receives HandlerArgs::Upload")
        };
        let fut = (self.0)(ctx, req_init, req);
        Box::pin(async move { HandlerOutcome::Result(fut.await) })
    }
}

struct SubscriptionFn<F>(F);
impl<F, Fut> Handler for SubscriptionFn<F>
where
    F: Fn(ProcedureHandlerContext, Value, Writable<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: ProcedureHandlerContext, args: HandlerArgs) -> BoxFuture<HandlerOutcome> {
        let HandlerArgs::Subscription { req_init, res } = args else {
            unreachable!("SubscriptionFn only ever receives HandlerArgs::Subscription")
        };
        let fut = (self.0)(ctx, req_init, res);
        Box::pin(async move {
            fut.await;
            HandlerOutcome::Void
        })
    }
}

struct StreamFn<F>(F);
impl<F, Fut> Handler for StreamFn<F>
where
    F: Fn(ProcedureHandlerContext, Value, Readable<Value, ErrorPayload>, Writable<Value>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: ProcedureHandlerContext, args: HandlerArgs) -> BoxFuture<HandlerOutcome> {
        let HandlerArgs::Stream { req_init, req, res } = args else {
            unreachable!("StreamFn only ever receives HandlerArgs::Stream")
        };
        let fut = (self.0)(ctx, req_init, req, res);
        Box::pin(async move {
            fut.await;
            HandlerOutcome::Void
        })
    }
}

/// One registered procedure: its kind, schemas, and handler
/// (spec.md §6 "Procedure definition surface").
pub struct ProcedureDef {
    pub kind: ProcedureKind,
    pub request_init: Arc<dyn Schema>,
    pub request_data: Option<Arc<dyn Schema>>,
    pub response_data: Arc<dyn Schema>,
    pub response_error: Option<Arc<dyn Schema>>,
    handler: Arc<dyn Handler>,
}

impl ProcedureDef {
    pub fn rpc<F, Fut>(request_init: Arc<dyn Schema>, response_data: Arc<dyn Schema>, handler: F) -> Self
    where
        F: Fn(ProcedureHandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Rpc,
            request_init,
            request_data: None,
            response_data,
            response_error: None,
            handler: Arc::new(RpcFn(handler)),
        }
    }

    pub fn upload<F, Fut>(
        request_init: Arc<dyn Schema>,
        request_data: Arc<dyn Schema>,
        response_data: Arc<dyn Schema>,
        handler: F,
    ) -> Self
    where
        F: Fn(ProcedureHandlerContext, Value, Readable<Value, ErrorPayload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Upload,
            request_init,
            request_data: Some(request_data),
            response_data,
            response_error: None,
            handler: Arc::new(UploadFn(handler)),
        }
    }

    pub fn subscription<F, Fut>(
        request_init: Arc<dyn Schema>,
        response_data: Arc<dyn Schema>,
        handler: F,
    ) -> Self
    where
        F: Fn(ProcedureHandlerContext, Value, Writable<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Subscription,
            request_init,
            request_data: None,
            response_data,
            response_error: None,
            handler: Arc::new(SubscriptionFn(handler)),
        }
    }

    pub fn stream<F, Fut>(
        request_init: Arc<dyn Schema>,
        request_data: Arc<dyn Schema>,
        response_data: Arc<dyn Schema>,
        handler: F,
    ) -> Self
    where
        F: Fn(ProcedureHandlerContext, Value, Readable<Value, ErrorPayload>, Writable<Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ProcedureDef {
            kind: ProcedureKind::Stream,
            request_init,
            request_data: Some(request_data),
            response_data,
            response_error: None,
            handler: Arc::new(StreamFn(handler)),
        }
    }

    pub fn with_response_error(mut self, schema: Arc<dyn Schema>) -> Self {
        self.response_error = Some(schema);
        self
    }
}

/// service name -> procedure name -> definition.
#[derive(Default)]
pub struct ServiceSchemaMap {
    services: HashMap<String, HashMap<String, ProcedureDef>>,
}

impl ServiceSchemaMap {
    pub fn new() -> Self {
        ServiceSchemaMap::default()
    }

    pub fn service(mut self, name: impl Into<String>, procedures: HashMap<String, ProcedureDef>) -> Self {
        self.services.insert(name.into(), procedures);
        self
    }

    fn find(&self, service: &str, procedure: &str) -> Option<&ProcedureDef> {
        self.services.get(service)?.get(procedure)
    }
}

/// Runs before a handler for every open; may short-circuit with an
/// `Err` rendered as an `Abort`, or register cleanup and pass through
/// (spec.md §4.6). Middleware share the stream's cleanup stack.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: &ProcedureHandlerContext) -> BoxFuture<Result<(), ErrorPayload>>;
}

struct Inner {
    sessions: HashMap<SessionId, Session>,
}

/// Owns a [`ServiceSchemaMap`] and dispatches inbound opens against it
/// (spec.md §4.6). One `Server` can drive many concurrent connections.
pub struct Server {
    id: PeerId,
    schema: Arc<ServiceSchemaMap>,
    config: ServerConfig,
    codec: Arc<dyn crate::codec::Codec>,
    middleware: Vec<Arc<dyn Middleware>>,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl Server {
    pub fn new(
        id: impl Into<PeerId>,
        schema: ServiceSchemaMap,
        config: ServerConfig,
        codec: Arc<dyn crate::codec::Codec>,
    ) -> Self {
        Server {
            id: id.into(),
            schema: Arc::new(schema),
            config,
            codec,
            middleware: Vec::new(),
            events: EventBus::new(),
            inner: Mutex::new(Inner { sessions: HashMap::new() }),
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    /// Drives one connection to completion: handshake, then the
    /// receive loop, until the transport closes. Intended to be spawned
    /// as its own task per inbound connection (spec.md §5 "a single
    /// background task per transport connection").
    pub async fn serve_connection(
        &self,
        connection: Arc<dyn Connection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let session = match self.handshake(&connection, &mut events).await {
            Some(session) => session,
            None => return,
        };

        let mut heartbeat = tokio::time::interval(session.heartbeat_interval());
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ConnectionEvent::Data(bytes)) => {
                            if !self.on_bytes(&session, &bytes).await {
                                break;
                            }
                        }
                        Some(ConnectionEvent::Closed) | None => {
                            session.detach();
                            self.schedule_grace(session.clone());
                            break;
                        }
                        Some(ConnectionEvent::Error(err)) => {
                            tracing::warn!(%err, "transport error");
                            session.detach();
                            self.schedule_grace(session.clone());
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if session.heartbeat_missed() {
                        tracing::warn!(session_id = %session.id, "heartbeat missed threshold, dropping connection");
                        connection.close();
                        session.detach();
                        self.schedule_grace(session.clone());
                        break;
                    }
                    let _ = session.send(
                        StreamId::generate(),
                        ControlFlags::NONE,
                        None,
                        None,
                        Payload::Control(ControlPayload::Ack),
                    );
                }
            }
        }
    }

    fn schedule_grace(&self, session: Session) {
        let grace = self.config.session.session_disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if session.state() == crate::proto::session::SessionState::NoConnection {
                session.expire();
            }
        });
    }

    async fn handshake(
        &self,
        connection: &Arc<dyn Connection>,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Option<Session> {
        let bytes = loop {
            match events.recv().await {
                Some(ConnectionEvent::Data(bytes)) => break bytes,
                Some(ConnectionEvent::Closed) | None => return None,
                Some(ConnectionEvent::Error(_)) => return None,
            }
        };

        let envelope = match self.codec.decode(&bytes) {
            Ok(Some(envelope)) => envelope,
            _ => {
                self.fail_handshake(connection, "malformed handshake frame");
                return None;
            }
        };

        let (from, session_id, protocol_version, expected_session_state, metadata) = match envelope.payload {
            Payload::Control(ControlPayload::HandshakeReq {
                protocol_version,
                session_id,
                expected_session_state,
                metadata,
            }) => (envelope.from, session_id, protocol_version, expected_session_state, metadata),
            _ => {
                self.fail_handshake(connection, "first frame was not HANDSHAKE_REQ");
                return None;
            }
        };

        let req = HandshakeRequest {
            protocol_version,
            expected_session_state,
            metadata,
        };

        let existing = self.inner.lock().unwrap().sessions.get(&session_id).cloned();
        let decision = handshake::negotiate(
            &req,
            &self.config.session.protocol_version,
            existing.as_ref().map(|s| s.next_sent_seq()),
            existing.as_ref().and_then(|s| s.retained_from_seq()),
        );

        match decision {
            Decision::Reject { kind, reason } => {
                self.events.emit(SessionEvent::Protocol(ProtocolErrorEvent {
                    kind,
                    session_id: Some(session_id),
                    message: reason.clone(),
                }));
                self.fail_handshake(connection, &reason);
                None
            }
            Decision::Fresh => {
                let session = Session::new(session_id, self.id.clone(), from, &self.config.session, self.codec.clone());
                self.inner.lock().unwrap().sessions.insert(session_id, session.clone());
                if session.attach(connection.clone()).is_err() {
                    return None;
                }
                self.send_handshake_resp(&session, true, None);
                Some(session)
            }
            Decision::Resume => {
                let session = existing.expect("Decision::Resume implies an existing session");
                if session
                    .resume(expected_session_state.next_expected_seq, connection.clone())
                    .is_err()
                {
                    return None;
                }
                self.send_handshake_resp(&session, true, None);
                Some(session)
            }
        }
    }

    fn send_handshake_resp(&self, session: &Session, ok: bool, reason: Option<String>) {
        let _ = session.send(
            StreamId::generate(),
            ControlFlags::NONE,
            None,
            None,
            Payload::Control(ControlPayload::HandshakeResp {
                ok,
                session_id: session.id,
                reason,
            }),
        );
    }

    fn fail_handshake(&self, connection: &Arc<dyn Connection>, reason: &str) {
        self.events.emit(SessionEvent::Protocol(ProtocolErrorEvent {
            kind: ProtocolErrorKind::HandshakeFailed,
            session_id: None,
            message: reason.to_string(),
        }));
        connection.close();
    }

    /// Processes one inbound byte frame. Returns `false` if the
    /// connection must be dropped (a protocol error occurred).
    async fn on_bytes(&self, session: &Session, bytes: &[u8]) -> bool {
        let incoming = match session.receive_bytes(bytes) {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return true,
            Err(FerruleError::Protocol(err)) => {
                tracing::warn!(session_id = %session.id, %err, "protocol error, dropping connection");
                self.events.emit(SessionEvent::Protocol(ProtocolErrorEvent {
                    kind: err.kind,
                    session_id: Some(session.id),
                    message: err.message,
                }));
                session.detach();
                self.schedule_grace(session.clone());
                return false;
            }
            Err(err) => {
                tracing::warn!(session_id = %session.id, %err, "failed to process inbound frame");
                return true;
            }
        };

        match incoming {
            Incoming::Control(ControlPayload::Close) => {
                session.detach();
                self.schedule_grace(session.clone());
                return false;
            }
            Incoming::Control(_) => {}
            Incoming::Delivered | Incoming::Discarded => {}
            Incoming::NeedsOpen(envelope) => self.handle_open(session, envelope).await,
        }
        true
    }

    async fn handle_open(&self, session: &Session, envelope: Envelope) {
        let stream_id = envelope.stream_id;
        let service_name = envelope.service_name.clone().unwrap_or_default();
        let procedure_name = envelope.procedure_name.clone().unwrap_or_default();

        let def = match self.schema.find(&service_name, &procedure_name) {
            Some(def) => def,
            None => {
                let _ = session.send(
                    stream_id,
                    ControlFlags::STREAM_ABORT,
                    None,
                    None,
                    Payload::Result(RpcResult::Err(ErrorPayload::invalid_request(format!(
                        "unknown procedure {service_name}.{procedure_name}"
                    )))),
                );
                return;
            }
        };

        let init_value = envelope.payload.as_data().cloned().unwrap_or(Value::Null);
        let req_init = match def.request_init.validate(init_value, ValidationMode::NonStrict) {
            Ok(v) => v,
            Err(err) => {
                let _ = session.send(
                    stream_id,
                    ControlFlags::STREAM_ABORT,
                    None,
                    None,
                    Payload::Result(RpcResult::Err(ErrorPayload::invalid_request(err.to_string()))),
                );
                return;
            }
        };

        session.open_stream(stream_id, def.kind, service_name.clone(), procedure_name.clone());
        if let Some(schema) = &def.request_data {
            session.set_req_data_schema(stream_id, schema.clone());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        {
            let cancel_tx = cancel_tx.clone();
            session.set_on_teardown(stream_id, move || {
                let _ = cancel_tx.send(true);
            });
        }

        let ctx = ProcedureHandlerContext {
            session_id: session.id,
            remote_peer_id: envelope.from.clone(),
            metadata: None,
            signal: CancelSignal(cancel_rx),
            session: session.clone(),
            stream_id,
        };

        for middleware in &self.middleware {
            if let Err(err) = middleware.call(&ctx).await {
                let _ = session.abort_stream(stream_id, err);
                return;
            }
        }

        let args = match def.kind {
            ProcedureKind::Rpc => {
                let routed = session.route(&envelope);
                debug_assert!(matches!(routed, crate::proto::streams::streams::Routed::Delivered));
                HandlerArgs::Rpc { req_init }
            }
            ProcedureKind::Upload => {
                let req = session.register_req_sink(stream_id);
                let routed = session.route(&envelope);
                debug_assert!(matches!(routed, crate::proto::streams::streams::Routed::Delivered));
                HandlerArgs::Upload { req_init, req }
            }
            ProcedureKind::Subscription => {
                let res = self.make_response_writable(session, stream_id, def.response_data.clone());
                let routed = session.route(&envelope);
                debug_assert!(matches!(routed, crate::proto::streams::streams::Routed::Delivered));
                HandlerArgs::Subscription { req_init, res }
            }
            ProcedureKind::Stream => {
                let req = session.register_req_sink(stream_id);
                let res = self.make_response_writable(session, stream_id, def.response_data.clone());
                let routed = session.route(&envelope);
                debug_assert!(matches!(routed, crate::proto::streams::streams::Routed::Delivered));
                HandlerArgs::Stream { req_init, req, res }
            }
        };

        let handler = def.handler.clone();
        let response_data_schema = def.response_data.clone();
        let response_error_schema = def.response_error.clone();
        let session = session.clone();
        tokio::spawn(async move {
            // A second join, rather than calling the handler directly,
            // so a panicking handler becomes an `UNCAUGHT_ERROR` abort
            // instead of silently dropping the stream (spec.md §4.6).
            let outcome = tokio::spawn(async move { handler.call(ctx, args).await }).await;
            match outcome {
                Ok(HandlerOutcome::Result(result)) => {
                    let result = validate_terminal_result(&response_data_schema, &response_error_schema, result);
                    let _ = session.close_local(stream_id, ControlFlags::NONE, Payload::Result(result));
                }
                Ok(HandlerOutcome::Void) => {}
                Err(join_err) => {
                    tracing::error!(stream_id = %stream_id, %join_err, "handler panicked");
                    let _ = session.abort_stream(stream_id, ErrorPayload::uncaught(join_err.to_string()));
                }
            }
        });
    }

    fn make_response_writable(
        &self,
        session: &Session,
        stream_id: StreamId,
        response_data: Arc<dyn Schema>,
    ) -> Writable<Value> {
        let session_for_write = session.clone();
        let session_for_close = session.clone();
        Writable::new(
            move |value: Value| {
                let value = response_data.validate(value, ValidationMode::NonStrict).map_err(|err| {
                    tracing::warn!(stream_id = %stream_id, %err, "handler wrote a response value that failed its declared schema");
                    WriteError::SchemaInvalid(err.to_string())
                })?;
                session_for_write
                    .send(stream_id, ControlFlags::NONE, None, None, Payload::Data(value))
                    .map_err(|_| WriteError::Closed)
            },
            move || {
                let _ = session_for_close.close_local(stream_id, ControlFlags::NONE, Payload::Data(Value::Null));
            },
        )
    }
}

/// Validates a handler's terminal result against its declared
/// `responseData`/`responseError` schemas before it goes out on the
/// wire. A handler that violates its own declared contract is a bug in
/// that handler, so a failure here is reported the same way a panic is
/// (spec.md §7 `UNCAUGHT_ERROR`), not as a peer-caused `ABORT`.
fn validate_terminal_result(
    response_data: &Arc<dyn Schema>,
    response_error: &Option<Arc<dyn Schema>>,
    result: RpcResult<Value>,
) -> RpcResult<Value> {
    match result {
        RpcResult::Ok(value) => match response_data.validate(value, ValidationMode::NonStrict) {
            Ok(value) => RpcResult::Ok(value),
            Err(err) => {
                tracing::error!(%err, "handler result failed its declared responseData schema");
                RpcResult::Err(ErrorPayload::uncaught(format!(
                    "handler response failed its declared schema: {err}"
                )))
            }
        },
        RpcResult::Err(error) => match (response_error, &error.extras) {
            (Some(schema), Some(extras)) => match schema.validate(extras.clone(), ValidationMode::NonStrict) {
                Ok(_) => RpcResult::Err(error),
                Err(err) => {
                    tracing::error!(%err, "handler error result failed its declared responseError schema");
                    RpcResult::Err(ErrorPayload::uncaught(format!(
                        "handler error payload failed its declared schema: {err}"
                    )))
                }
            },
            _ => RpcResult::Err(error),
        },
    }
}
