//! The codec contract (spec.md §6): symmetric `encode`/`decode`, tolerant
//! of unknown fields on decode. The core depends only on the [`Codec`]
//! trait; [`JsonCodec`] is the reference implementation this crate ships
//! and tests against, the way h2 ships HPACK concretely behind an
//! abstract transport.

use crate::envelope::Envelope;
use crate::error::CodecError;

/// Encodes/decodes [`Envelope`]s to/from bytes for one logical message
/// per call — transports are message-oriented (spec.md §6); a
/// stream-oriented transport is responsible for its own framing before
/// handing bytes to a `Codec`.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;

    /// Returns `Ok(None)` for input that decodes to "no message" (e.g. an
    /// empty keepalive frame some transports send); returns `Err` only for
    /// genuinely malformed input.
    fn decode(&self, bytes: &[u8]) -> Result<Option<Envelope>, CodecError>;
}

/// A plain `serde_json`-based codec. Binary payloads are not exercised by
/// this crate's own procedures (the spec's "binary payloads must
/// round-trip" requirement is a contract on the codec, not this
/// reference impl, which carries everything as JSON values); a
/// production codec swaps this for msgpack or a length-prefixed binary
/// form without the rest of the crate noticing.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<Envelope>, CodecError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}
