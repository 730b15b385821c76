//! The envelope: the single opaque unit crossing the wire (spec.md §3, §4.2).

use crate::control::ControlFlags;
use crate::id::{MessageId, PeerId, StreamId};
use crate::result::RpcResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, application-defined propagation context (e.g. a trace id).
/// The core never interprets it, only threads it through.
pub type TracingContext = Value;

/// The handshake and out-of-band control messages that share the envelope
/// shape with data frames (spec.md §4.2, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlPayload {
    #[serde(rename = "HANDSHAKE_REQ")]
    HandshakeReq {
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
        #[serde(rename = "sessionId")]
        session_id: crate::id::SessionId,
        #[serde(rename = "expectedSessionState")]
        expected_session_state: ExpectedSessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    #[serde(rename = "HANDSHAKE_RESP")]
    HandshakeResp {
        ok: bool,
        #[serde(rename = "sessionId")]
        session_id: crate::id::SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "ACK")]
    Ack,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpectedSessionState {
    #[serde(rename = "nextExpectedSeq")]
    pub next_expected_seq: u64,
    #[serde(rename = "nextSentSeq")]
    pub next_sent_seq: u64,
}

/// What an envelope carries, beyond its routing/ack fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    /// A handshake/close/ack control message.
    Control(ControlPayload),
    /// A terminal `rpc`/`upload` result, or an `Abort` payload.
    Result(RpcResult<Value>),
    /// A raw application data value (request-init, stream data, etc).
    Data(Value),
}

impl Payload {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Payload::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            Payload::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&RpcResult<Value>> {
        match self {
            Payload::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<RpcResult<Value>> {
        match self {
            Payload::Result(r) => Some(r),
            _ => None,
        }
    }
}

/// The unit crossing the wire (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    pub from: PeerId,
    pub to: PeerId,
    pub seq: u64,
    pub ack: u64,
    #[serde(rename = "streamId")]
    pub stream_id: StreamId,
    #[serde(rename = "controlFlags")]
    pub control_flags: ControlFlags,
    #[serde(rename = "serviceName", default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(rename = "procedureName", default, skip_serializing_if = "Option::is_none")]
    pub procedure_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingContext>,
    pub payload: Payload,
}

/// Builds envelopes for a single sender identity. `seq`/`ack`/`id` are
/// stamped by the session's send path ([`crate::proto::session::Session::send`]),
/// never by callers directly, so this builder only fixes the fields that
/// are constant for a given sender.
#[derive(Debug, Clone)]
pub struct EnvelopeTemplate {
    pub from: PeerId,
    pub to: PeerId,
}

impl EnvelopeTemplate {
    pub fn new(from: impl Into<PeerId>, to: impl Into<PeerId>) -> Self {
        EnvelopeTemplate {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Constructs an envelope with the routing fields filled in and
    /// `seq`/`ack` left at zero, ready for [`crate::proto::session::Session::send`]
    /// to stamp.
    pub fn build(
        &self,
        stream_id: StreamId,
        control_flags: ControlFlags,
        payload: Payload,
    ) -> Envelope {
        Envelope {
            id: MessageId::generate(),
            from: self.from.clone(),
            to: self.to.clone(),
            seq: 0,
            ack: 0,
            stream_id,
            control_flags,
            service_name: None,
            procedure_name: None,
            tracing: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, JsonCodec};

    #[test]
    fn encode_decode_round_trips_a_data_envelope() {
        let template = EnvelopeTemplate::new("client-a", "server-b");
        let mut env = template.build(
            StreamId::generate(),
            ControlFlags::STREAM_OPEN,
            Payload::Data(serde_json::json!({"n": 3})),
        );
        env.seq = 5;
        env.ack = 2;
        env.service_name = Some("test".into());
        env.procedure_name = Some("add".into());

        let codec = JsonCodec::default();
        let bytes = codec.encode(&env).unwrap();
        let decoded = codec.decode(&bytes).unwrap().unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn unknown_fields_are_tolerated_on_decode() {
        let raw = serde_json::json!({
            "id": uuid::Uuid::new_v4(),
            "from": "a",
            "to": "b",
            "seq": 1,
            "ack": 0,
            "streamId": uuid::Uuid::new_v4(),
            "controlFlags": 0,
            "payload": {"hello": "world"},
            "fromTheFuture": true,
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let codec = JsonCodec::default();
        assert!(codec.decode(&bytes).unwrap().is_some());
    }
}
