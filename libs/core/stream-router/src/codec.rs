//! Event wire encoding

use crate::error::CodecError;
use crate::event::Event;

/// Converts events to and from message bodies.
pub trait Codec: Send + Sync {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, body: &[u8]) -> Result<Event, CodecError>;
}

/// JSON envelope via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Event, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
