//! The `RpcResult<T, E>` tagged union carried as the terminal payload of
//! `rpc`/`upload` procedures, and as the payload of any `StreamAbort` frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved error codes a peer may observe on an `Err` result. Application
/// procedures are free to use their own codes for `responseError` payloads;
/// these are the ones the framework itself produces.
pub mod codes {
    /// The handler panicked or returned an error that was not surfaced
    /// through its declared `responseError` schema.
    pub const UNCAUGHT_ERROR: &str = "UNCAUGHT_ERROR";
    /// Either side cancelled the stream.
    pub const ABORT: &str = "ABORT";
    /// The session's grace period elapsed with no reconnect.
    pub const UNEXPECTED_DISCONNECT: &str = "UNEXPECTED_DISCONNECT";
    /// The open frame failed schema validation or named an unknown
    /// service/procedure.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// The local `Readable` was broken by the consumer.
    pub const READABLE_BROKEN: &str = "READABLE_BROKEN";
}

/// The `Err` arm of an [`RpcResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorPayload {
            code: code.into(),
            message: message.into(),
            extras: None,
        }
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = Some(extras);
        self
    }

    pub fn uncaught(message: impl Into<String>) -> Self {
        Self::new(codes::UNCAUGHT_ERROR, message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(codes::ABORT, message)
    }

    pub fn unexpected_disconnect() -> Self {
        Self::new(
            codes::UNEXPECTED_DISCONNECT,
            "session grace period elapsed before reconnect",
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// A value failed the schema declared for it (spec.md §7 propagation
    /// policy: "logged and synthesized as `{code:ABORT, message:"...
    /// invalid payload"}`").
    pub fn invalid_payload(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::ABORT, format!("received invalid payload: {detail}"))
    }

    pub fn readable_broken() -> Self {
        Self::new(codes::READABLE_BROKEN, "reader was broken by the consumer")
    }
}

/// `{ok:true,payload:T} | {ok:false,payload:ErrorPayload}`.
///
/// Serializes with an explicit `ok` discriminant rather than serde's
/// default untagged representation, matching the wire shape the spec
/// names exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult<T = Value> {
    Ok(T),
    Err(ErrorPayload),
}

impl<T> RpcResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, RpcResult::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            RpcResult::Ok(v) => Some(v),
            RpcResult::Err(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RpcResult<U> {
        match self {
            RpcResult::Ok(v) => RpcResult::Ok(f(v)),
            RpcResult::Err(e) => RpcResult::Err(e),
        }
    }
}

impl<T: Serialize> Serialize for RpcResult<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Wire<'a, T> {
            ok: bool,
            payload: &'a Payload<'a, T>,
        }
        enum Payload<'a, T> {
            Data(&'a T),
            Err(&'a ErrorPayload),
        }
        impl<'a, T: Serialize> Serialize for Payload<'a, T> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                match self {
                    Payload::Data(v) => v.serialize(s),
                    Payload::Err(e) => e.serialize(s),
                }
            }
        }

        match self {
            RpcResult::Ok(v) => Wire {
                ok: true,
                payload: &Payload::Data(v),
            }
            .serialize(serializer),
            RpcResult::Err(e) => Wire {
                ok: false,
                payload: &Payload::<T>::Err(e),
            }
            .serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for RpcResult<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let ok = raw
            .get("ok")
            .and_then(Value::as_bool)
            .ok_or_else(|| serde::de::Error::missing_field("ok"))?;
        let payload = raw
            .get("payload")
            .cloned()
            .ok_or_else(|| serde::de::Error::missing_field("payload"))?;

        if ok {
            let value = serde_json::from_value(payload).map_err(serde::de::Error::custom)?;
            Ok(RpcResult::Ok(value))
        } else {
            let err: ErrorPayload =
                serde_json::from_value(payload).map_err(serde::de::Error::custom)?;
            Ok(RpcResult::Err(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_round_trips() {
        let r = RpcResult::Ok(serde_json::json!({"n": 3}));
        let s = serde_json::to_string(&r).unwrap();
        let back: RpcResult<Value> = serde_json::from_str(&s).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn err_round_trips() {
        let r: RpcResult<Value> = RpcResult::Err(ErrorPayload::new("DIV_BY_ZERO", "nope"));
        let s = serde_json::to_string(&r).unwrap();
        let back: RpcResult<Value> = serde_json::from_str(&s).unwrap();
        assert_eq!(r, back);
    }
}
