//! A single logical stream's state (spec.md §3, §4.4): the per-procedure
//! invocation record the session's [`super::store::Store`] owns, keyed by
//! [`StreamId`].

use crate::id::StreamId;
use crate::result::ErrorPayload;
use crate::rw::ReadableController;
use crate::schema::Schema;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Rpc,
    Upload,
    Subscription,
    Stream,
}

impl ProcedureKind {
    /// Whether the client's open frame also carries `StreamClosed`
    /// (spec.md §4.4 table: `rpc` and `subscription` close their request
    /// half with the open frame).
    pub fn client_closes_with_open(self) -> bool {
        matches!(self, ProcedureKind::Rpc | ProcedureKind::Subscription)
    }

    /// Whether the client ever writes request data frames after open.
    pub fn client_writes_data(self) -> bool {
        matches!(self, ProcedureKind::Upload | ProcedureKind::Stream)
    }

    /// Whether the server ever writes more than one response value.
    pub fn server_streams_response(self) -> bool {
        matches!(self, ProcedureKind::Subscription | ProcedureKind::Stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Aborted,
}

impl StreamState {
    pub fn close_local(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    pub fn close_remote(self) -> StreamState {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    pub fn abort(self) -> StreamState {
        StreamState::Aborted
    }

    pub fn is_closed(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Aborted)
    }
}

/// Deferred cleanup callbacks, run in LIFO order exactly once when a
/// stream fully closes (spec.md §4.4). A callback registered after
/// teardown runs immediately; a panicking callback never prevents the
/// rest from running.
#[derive(Default)]
pub struct CleanupStack {
    pending: Vec<Box<dyn FnOnce() + Send>>,
    torn_down: bool,
}

impl CleanupStack {
    pub fn defer(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        if self.torn_down {
            Self::run_one(Box::new(cleanup));
        } else {
            self.pending.push(Box::new(cleanup));
        }
    }

    /// Runs every registered cleanup, most-recently-registered first.
    /// Safe to call more than once; only the first call does anything.
    pub fn run_all(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        while let Some(cleanup) = self.pending.pop() {
            Self::run_one(cleanup);
        }
    }

    fn run_one(cleanup: Box<dyn FnOnce() + Send>) {
        if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
            tracing::error!("stream cleanup callback panicked");
        }
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending", &self.pending.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

/// The session-owned bookkeeping record for one stream. Holds only the
/// untyped request/response sinks needed to route inbound frames; the
/// typed `Readable`/`Writable` handles applications see live in
/// `client`/`server`, paired 1:1 with the [`ReadableController`]s
/// registered here.
pub struct StreamEntry {
    pub id: StreamId,
    pub service_name: String,
    pub procedure_name: String,
    pub kind: ProcedureKind,
    pub state: StreamState,
    pub cleanup: CleanupStack,
    /// Set once the stream is removed-pending (abort/close processed)
    /// so that late-arriving frames for the same id are dropped
    /// silently rather than erroring (spec.md §9 "Tombstoning").
    pub tombstoned: bool,
    /// Feeds inbound request-half data frames; present on the side that
    /// terminates the request half (the server, for `upload`/`stream`).
    pub req_sink: Option<ReadableController<Value, ErrorPayload>>,
    /// Feeds inbound response-half data/result frames; present on the
    /// side that terminates the response half (the client, for all four
    /// kinds).
    pub res_sink: Option<ReadableController<Value, ErrorPayload>>,
    /// Validates values pushed into `req_sink` (the server's declared
    /// `requestData` schema, spec.md §6). `None` means no enforcement.
    pub req_data_schema: Option<Arc<dyn Schema>>,
    /// Validates `Ok` values pushed into `res_sink` (the `responseData`
    /// schema the caller declared it expects back).
    pub res_data_schema: Option<Arc<dyn Schema>>,
    /// Validates the `extras` of `Err` values pushed into `res_sink`
    /// (the `responseError` schema), when both are present.
    pub res_error_schema: Option<Arc<dyn Schema>>,
    /// Fires exactly once, before the cleanup stack, when the stream
    /// tears down (both halves closed, or aborted from either side).
    /// Lets `server`/`client` close whichever locally-held `Writable` or
    /// cancellation signal isn't reachable through `req_sink`/`res_sink`
    /// (spec.md §4.5 "writes to resWritable after ctx.cancel are
    /// silently dropped").
    pub on_teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamEntry {
    pub fn new(
        id: StreamId,
        kind: ProcedureKind,
        service_name: String,
        procedure_name: String,
    ) -> Self {
        StreamEntry {
            id,
            service_name,
            procedure_name,
            kind,
            state: StreamState::Open,
            cleanup: CleanupStack::default(),
            tombstoned: false,
            req_sink: None,
            res_sink: None,
            req_data_schema: None,
            res_data_schema: None,
            res_error_schema: None,
            on_teardown: None,
        }
    }

    pub fn mark_local_closed(&mut self) {
        self.state = self.state.close_local();
    }

    pub fn mark_remote_closed(&mut self) {
        self.state = self.state.close_remote();
    }

    pub fn mark_aborted(&mut self) {
        self.state = self.state.abort();
    }

    pub fn is_fully_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("id", &self.id)
            .field("service_name", &self.service_name)
            .field("procedure_name", &self.procedure_name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("tombstoned", &self.tombstoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn half_close_both_sides_reaches_closed() {
        let mut state = StreamState::Open;
        state = state.close_local();
        assert_eq!(state, StreamState::HalfClosedLocal);
        state = state.close_remote();
        assert_eq!(state, StreamState::Closed);
        assert!(state.is_closed());
    }

    #[test]
    fn half_close_either_order_reaches_closed() {
        let mut state = StreamState::Open;
        state = state.close_remote();
        state = state.close_local();
        assert_eq!(state, StreamState::Closed);
    }

    #[test]
    fn cleanups_run_lifo_exactly_once_even_if_one_panics() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = CleanupStack::default();

        let o1 = order.clone();
        stack.defer(move || o1.lock().unwrap().push(1));
        stack.defer(|| panic!("boom"));
        let o3 = order.clone();
        stack.defer(move || o3.lock().unwrap().push(3));

        stack.run_all();
        stack.run_all(); // second call is a no-op

        assert_eq!(*order.lock().unwrap(), vec![3, 1]);
    }

    #[test]
    fn cleanup_registered_after_teardown_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = CleanupStack::default();
        stack.run_all();

        let ran2 = ran.clone();
        stack.defer(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
