//! Opaque identifiers used throughout a session.
//!
//! The wire protocol treats all of these as opaque strings; this module
//! picks UUIDv4 as the concrete representation, the same choice
//! `rt-protocol` makes for its wire identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random id.
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                $name(u)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

opaque_id!(StreamId, "Identifies a logical stream within a session.");
opaque_id!(SessionId, "Identifies a session, stable across reconnects.");
opaque_id!(MessageId, "Identifies a single envelope; debugging/tracing only.");

/// A peer identifier (client or server name). The spec treats these as
/// plain strings supplied by the application, not generated ids.
pub type PeerId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_json() {
        let id = StreamId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(StreamId::generate(), StreamId::generate());
    }
}
