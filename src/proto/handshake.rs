//! Handshake negotiation (spec.md §4.3, §4.7): protocol version checks
//! and session-resumption eligibility, kept as pure functions so the
//! session-registry bookkeeping in `server`/`client` can decide what
//! "known session" and "retained buffer" mean without this module
//! reaching back into their state.

use crate::envelope::ExpectedSessionState;
use crate::events::ProtocolErrorKind;

/// Bumped whenever the envelope/control-payload wire shape changes in a
/// way older peers can't tolerate.
pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub protocol_version: String,
    pub expected_session_state: ExpectedSessionState,
    pub metadata: Option<serde_json::Value>,
}

/// What the server should do in response to one handshake request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No existing session for this id: start a fresh one at seq 0.
    Fresh,
    /// An existing session is resumed at its current counters.
    Resume,
    /// Fatal: the connection must be dropped and no session created or
    /// kept; `kind`/`reason` become a `protocolError` event.
    Reject {
        kind: ProtocolErrorKind,
        reason: String,
    },
}

/// `existing` is `Some(next_sent_seq)` when a session with the requested
/// id is already known to this side; `retained_from_seq` is the lowest
/// `seq` still present in that session's `sendBuffer` (the oldest frame
/// resumption could possibly replay).
pub fn negotiate(
    req: &HandshakeRequest,
    expected_version: &str,
    existing_next_sent_seq: Option<u64>,
    retained_from_seq: Option<u64>,
) -> Decision {
    if req.protocol_version != expected_version {
        return Decision::Reject {
            kind: ProtocolErrorKind::HandshakeFailed,
            reason: format!(
                "unsupported protocol version {:?}, expected {expected_version:?}",
                req.protocol_version
            ),
        };
    }

    let Some(next_sent_seq) = existing_next_sent_seq else {
        return Decision::Fresh;
    };

    let requested = req.expected_session_state.next_expected_seq;
    let covered = match retained_from_seq {
        Some(from) => requested >= from && requested <= next_sent_seq,
        None => requested == next_sent_seq,
    };

    if covered {
        Decision::Resume
    } else {
        Decision::Reject {
            kind: ProtocolErrorKind::SessionStateMismatch,
            reason: "requested resumption point is outside the retained send buffer".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(next_expected_seq: u64) -> HandshakeRequest {
        HandshakeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            expected_session_state: ExpectedSessionState {
                next_expected_seq,
                next_sent_seq: 0,
            },
            metadata: None,
        }
    }

    #[test]
    fn unknown_session_is_fresh() {
        assert_eq!(negotiate(&req(0), PROTOCOL_VERSION, None, None), Decision::Fresh);
    }

    #[test]
    fn known_session_within_retained_window_resumes() {
        assert_eq!(
            negotiate(&req(5), PROTOCOL_VERSION, Some(10), Some(3)),
            Decision::Resume
        );
    }

    #[test]
    fn known_session_outside_retained_window_is_rejected_as_state_mismatch() {
        let decision = negotiate(&req(1), PROTOCOL_VERSION, Some(10), Some(3));
        assert!(matches!(
            decision,
            Decision::Reject {
                kind: ProtocolErrorKind::SessionStateMismatch,
                ..
            }
        ));
    }

    #[test]
    fn version_mismatch_is_rejected_as_handshake_failed() {
        let mut bad = req(0);
        bad.protocol_version = "0.1.0".to_string();
        let decision = negotiate(&bad, PROTOCOL_VERSION, None, None);
        assert!(matches!(
            decision,
            Decision::Reject {
                kind: ProtocolErrorKind::HandshakeFailed,
                ..
            }
        ));
    }
}
