//! Routes inbound envelopes to the right [`StreamEntry`] and runs the
//! per-kind lifecycle described in spec.md §4.4. Adapted from
//! `carllerche-h2`'s `proto::streams::streams::Streams`, which plays the
//! same "find-or-open, then transition" role for HTTP/2 stream state.

use super::store::{Entry, Key, Store};
use super::stream::{ProcedureKind, StreamEntry};
use crate::control::ControlFlags;
use crate::envelope::{Envelope, Payload};
use crate::id::StreamId;
use crate::result::{ErrorPayload, RpcResult};
use crate::schema::{Schema, ValidationMode};
use serde_json::Value;
use std::sync::Arc;

/// What happened to one inbound envelope, reported back to the driver
/// loop in `client`/`server` so it can take any further action the
/// low-level routing can't (e.g. constructing a brand-new handler).
#[derive(Debug)]
pub enum Routed {
    /// A new stream open frame with no existing entry; the caller is
    /// responsible for validating and inserting one via
    /// [`Streams::open_local`]/[`Streams::open_remote`], then calling
    /// [`Streams::route`] again for the same envelope.
    NeedsOpen,
    /// Delivered into an existing stream's local sink; nothing further
    /// to do.
    Delivered,
    /// The referenced stream does not exist (or is tombstoned); the
    /// frame was silently discarded per spec.md §9.
    Discarded,
}

#[derive(Default)]
pub struct Streams {
    store: Store,
    tombstones: fnv::FnvHashSet<StreamId>,
}

impl Streams {
    pub fn new() -> Self {
        Streams::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, key: Key) -> Option<&StreamEntry> {
        self.store.get(key)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut StreamEntry> {
        self.store.get_mut(key)
    }

    pub fn find(&self, id: &StreamId) -> Option<Key> {
        self.store.find(id)
    }

    /// Inserts a brand-new stream entry for `id`, as either side may do:
    /// the client when invoking a procedure, the server when accepting
    /// a validated open frame.
    pub fn insert(
        &mut self,
        id: StreamId,
        kind: ProcedureKind,
        service_name: String,
        procedure_name: String,
    ) -> Key {
        self.store
            .insert(id, StreamEntry::new(id, kind, service_name, procedure_name))
    }

    /// Installs the `requestData` schema enforced on values arriving on
    /// this stream's request half (server-side `upload`/`stream`).
    pub fn set_req_data_schema(&mut self, id: StreamId, schema: Arc<dyn Schema>) {
        if let Some(key) = self.store.find(&id) {
            self.store[key].req_data_schema = Some(schema);
        }
    }

    /// Installs the `responseData`/`responseError` schemas enforced on
    /// values arriving on this stream's response half (client-side).
    pub fn set_res_schemas(&mut self, id: StreamId, data: Arc<dyn Schema>, error: Option<Arc<dyn Schema>>) {
        if let Some(key) = self.store.find(&id) {
            self.store[key].res_data_schema = Some(data);
            self.store[key].res_error_schema = error;
        }
    }

    /// Routes one inbound envelope. Call with the same envelope again
    /// after handling [`Routed::NeedsOpen`] by inserting the new entry.
    pub fn route(&mut self, envelope: &Envelope) -> Routed {
        let id = envelope.stream_id;

        let key = match self.store.find_entry(id) {
            Entry::Occupied(key) => key,
            Entry::Vacant(_) => {
                if self.tombstones.contains(&id) {
                    return Routed::Discarded;
                }
                if envelope.control_flags.is_open() {
                    return Routed::NeedsOpen;
                }
                tracing::debug!(stream_id = %id, "dropping frame for unknown stream");
                return Routed::Discarded;
            }
        };

        if self.store[key].tombstoned {
            return Routed::Discarded;
        }

        if envelope.control_flags.is_abort() {
            self.handle_abort(key, envelope);
            return Routed::Delivered;
        }

        // An open frame's payload is requestInit, a one-time value the
        // caller already extracted before routing; it is not a reqData/
        // response item and must not also land in the sink.
        if !envelope.control_flags.is_open() {
            if let Payload::Data(value) = &envelope.payload {
                self.push_local(key, Ok(value.clone()));
            } else if let Payload::Result(result) = &envelope.payload {
                self.push_local(key, result_to_item(result.clone()));
            }
        }

        if envelope.control_flags.is_close_request() {
            tracing::debug!(stream_id = %id, "peer requested close");
        }

        if envelope.control_flags.is_closed() {
            self.close_remote(key);
        }

        Routed::Delivered
    }

    fn push_local(&mut self, key: Key, item: Result<Value, ErrorPayload>) {
        let entry = &self.store[key];
        if let Some(sink) = entry.req_sink.as_ref() {
            let validated = validate_against(item.clone(), entry.req_data_schema.as_deref(), None);
            sink.push_value(validated);
        }
        if let Some(sink) = entry.res_sink.as_ref() {
            let validated = validate_against(
                item,
                entry.res_data_schema.as_deref(),
                entry.res_error_schema.as_deref(),
            );
            sink.push_value(validated);
        }
    }

    fn close_remote(&mut self, key: Key) {
        self.store[key].mark_remote_closed();
        {
            let entry = &self.store[key];
            if let Some(sink) = entry.req_sink.as_ref() {
                sink.trigger_close();
            }
            if let Some(sink) = entry.res_sink.as_ref() {
                sink.trigger_close();
            }
        }
        self.finish_if_closed(key);
    }

    /// Marks the local side closed (we sent `StreamClosed`); mirrors
    /// [`close_remote`] for the send path.
    pub fn close_local(&mut self, key: Key) {
        self.store[key].mark_local_closed();
        self.finish_if_closed(key);
    }

    /// [`close_local`](Self::close_local) by [`StreamId`], a no-op if
    /// the stream is already gone (e.g. aborted concurrently).
    pub fn close_local_by_id(&mut self, id: StreamId) {
        if let Some(key) = self.store.find(&id) {
            self.close_local(key);
        }
    }

    /// [`abort_local`](Self::abort_local) by [`StreamId`], a no-op if
    /// the stream is already gone.
    pub fn abort_local_by_id(&mut self, id: StreamId, error: &ErrorPayload) {
        if let Some(key) = self.store.find(&id) {
            self.abort_local(key, error);
        }
    }

    fn handle_abort(&mut self, key: Key, envelope: &Envelope) {
        let error = match &envelope.payload {
            Payload::Result(RpcResult::Err(e)) => e.clone(),
            _ => ErrorPayload::abort("peer sent a malformed abort frame"),
        };

        {
            let entry = &self.store[key];
            if let Some(sink) = entry.req_sink.as_ref() {
                sink.push_value(Err(error.clone()));
                sink.trigger_close();
            }
            if let Some(sink) = entry.res_sink.as_ref() {
                sink.push_value(Err(error.clone()));
                sink.trigger_close();
            }
        }

        self.store[key].mark_aborted();
        self.tombstone_and_remove(key);
    }

    /// Aborts a stream from the local side (client cancellation,
    /// `ctx.cancel`, or an uncaught handler error). Returns the removed
    /// entry's id so the caller can send the wire `StreamAbort` frame.
    pub fn abort_local(&mut self, key: Key, error: &ErrorPayload) -> StreamId {
        let id = {
            let entry = &self.store[key];
            if let Some(sink) = entry.req_sink.as_ref() {
                sink.push_value(Err(error.clone()));
                sink.trigger_close();
            }
            if let Some(sink) = entry.res_sink.as_ref() {
                sink.push_value(Err(error.clone()));
                sink.trigger_close();
            }
            entry.id
        };
        self.store[key].mark_aborted();
        self.tombstone_and_remove(key);
        id
    }

    fn finish_if_closed(&mut self, key: Key) {
        if self.store[key].is_fully_closed() {
            self.tombstone_and_remove(key);
        }
    }

    fn tombstone_and_remove(&mut self, key: Key) {
        if let Some(teardown) = self.store[key].on_teardown.take() {
            teardown();
        }
        self.store[key].cleanup.run_all();
        self.store[key].tombstoned = true;
        let id = self.store[key].id;
        self.tombstones.insert(id);
        self.store.remove(&id);
    }

    /// Aborts and removes every live stream, used when a session's
    /// grace period elapses with no reconnect (spec.md §4.3, §4.5).
    pub fn abort_all(&mut self, error: &ErrorPayload) {
        let ids: Vec<StreamId> = self.store.ids().copied().collect();
        for id in ids {
            if let Some(key) = self.store.find(&id) {
                self.abort_local(key, error);
            }
        }
    }
}

/// Enforces a sink's declared schemas on one inbound item (spec.md §6,
/// §7 "Schema failures on responses received by the client are logged
/// and synthesized as an ABORT"). `data_schema` governs `Ok` values;
/// `error_schema` governs the `extras` of an `Err` value that carries
/// any (an error with no `extras` passes through unchecked — there is
/// nothing declared to validate).
fn validate_against(
    item: Result<Value, ErrorPayload>,
    data_schema: Option<&dyn Schema>,
    error_schema: Option<&dyn Schema>,
) -> Result<Value, ErrorPayload> {
    match item {
        Ok(value) => match data_schema {
            Some(schema) => schema
                .validate(value, ValidationMode::NonStrict)
                .map_err(|err| {
                    tracing::warn!(%err, "inbound value failed its declared schema");
                    ErrorPayload::invalid_payload(err)
                }),
            None => Ok(value),
        },
        Err(error) => match (error_schema, error.extras.clone()) {
            (Some(schema), Some(extras)) => match schema.validate(extras, ValidationMode::NonStrict) {
                Ok(_) => Err(error),
                Err(err) => {
                    tracing::warn!(%err, "inbound error payload failed its declared schema");
                    Err(ErrorPayload::invalid_payload(err))
                }
            },
            _ => Err(error),
        },
    }
}

fn result_to_item(result: RpcResult<Value>) -> Result<Value, ErrorPayload> {
    match result {
        RpcResult::Ok(v) => Ok(v),
        RpcResult::Err(e) => Err(e),
    }
}
