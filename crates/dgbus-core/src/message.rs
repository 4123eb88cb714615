//! Completed messages and payload decoding.
//!
//! The transport only moves bytes. Once every chunk of a message is in
//! hand, a `PayloadDecoder` turns the concatenated payload into a
//! property map that subscribers consume.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String keys mapped to arbitrary serializable values.
pub type Properties = Map<String, Value>;

/// A fully reassembled message. Immutable; shared to every handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub properties: Properties,
    /// Reassembled payload bytes, in sequence order.
    #[serde(skip)]
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, properties: Properties, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            properties,
            payload,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("payload of {len} bytes is not a property map: {reason}")]
pub struct DeserializeError {
    pub len: usize,
    pub reason: String,
}

/// Turns a reassembled payload into properties.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Properties, DeserializeError>;
}

impl<F> PayloadDecoder for F
where
    F: Fn(&[u8]) -> Result<Properties, DeserializeError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<Properties, DeserializeError> {
        self(payload)
    }
}

/// Payloads are a single JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadDecoder;

impl PayloadDecoder for JsonPayloadDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Properties, DeserializeError> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(DeserializeError {
                len: payload.len(),
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
            Err(e) => Err(DeserializeError {
                len: payload.len(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Serialize properties the way `JsonPayloadDecoder` reads them.
pub fn encode_properties(properties: &Properties) -> Vec<u8> {
    // A map of `Value`s always serializes.
    serde_json::to_vec(properties).unwrap_or_default()
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
