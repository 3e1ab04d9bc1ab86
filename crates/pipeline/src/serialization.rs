//! Body serialization seam.

use {bytes::Bytes, serde_json::Value};

use conveyor_common::MessageMetadata;

use crate::error::{Error, Result};

/// Converts logical message instances to and from wire bodies.
pub trait MessageSerializer: Send + Sync {
    /// Value written to the content-type header.
    fn content_type(&self) -> &str;

    fn serialize(&self, metadata: &MessageMetadata, message: &Value) -> Result<Bytes>;

    fn deserialize(&self, metadata: &MessageMetadata, body: &[u8]) -> Result<Value>;
}

/// Reference serializer writing compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, metadata: &MessageMetadata, message: &Value) -> Result<Bytes> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|source| Error::Serialize {
                message_type: metadata.message_type.clone(),
                source,
            })
    }

    fn deserialize(&self, metadata: &MessageMetadata, body: &[u8]) -> Result<Value> {
        serde_json::from_slice(body).map_err(|source| Error::Deserialize {
            message_type: metadata.message_type.clone(),
            source,
        })
    }
}
