//! Envelope (de)serialization contract.

use crate::error::SerializationError;
use crate::Envelope;

/// Converts envelopes to and from the bytes stored in the `body` column.
pub trait EnvelopeSerializer: Send + Sync {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(&self, data: &[u8]) -> Result<Envelope, SerializationError>;
}

/// Default serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeSerializer;

impl EnvelopeSerializer for JsonEnvelopeSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(envelope).map_err(|e| SerializationError::Serialize {
            id: envelope.id,
            reason: e.to_string(),
        })
    }

    fn deserialize(&self, data: &[u8]) -> Result<Envelope, SerializationError> {
        serde_json::from_slice(data).map_err(|e| SerializationError::Deserialize {
            len: data.len(),
            reason: e.to_string(),
        })
    }
}
