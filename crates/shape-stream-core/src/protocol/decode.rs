//! Response decoding

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportResponse;
use crate::error::StreamError;

/// Turns a successful main-stream response into messages for subscribers
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, response: &TransportResponse) -> Result<Vec<Value>, StreamError>;
}

/// Decodes a JSON array body; an empty body means "no changes"
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl MessageDecoder for JsonDecoder {
    fn decode(&self, response: &TransportResponse) -> Result<Vec<Value>, StreamError> {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_slice(&response.body)
            .map_err(|e| StreamError::Decode(e.to_string()))?;
        Ok(match value {
            Value::Array(items) => items,
            other => vec![other],
        })
    }
}

/// Body of a snapshot response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl SnapshotResponse {
    pub fn decode(response: &TransportResponse) -> Result<Self, StreamError> {
        serde_json::from_slice(&response.body).map_err(|e| StreamError::Decode(e.to_string()))
    }
}

/// Whether a message is the `up-to-date` control message
pub fn is_up_to_date(message: &Value) -> bool {
    message
        .get("headers")
        .and_then(|h| h.get("control"))
        .and_then(|c| c.as_str())
        == Some("up-to-date")
}
