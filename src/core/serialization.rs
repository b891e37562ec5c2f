//! # Serialization Formats
//!
//! Envelope encodings used inside bundles. Both formats are self-describing so
//! that command payloads can stay free-form maps.
//!
//! - **JSON**: default, human-readable, interoperable
//! - **MessagePack**: compact binary with named fields (`to_vec_named`)
//!
//! ## Usage
//! ```rust
//! use bundle_net::core::serialization::SerializationFormat;
//! use std::collections::BTreeMap;
//!
//! let mut value = BTreeMap::new();
//! value.insert("Ping".to_string(), 42i64);
//! let bytes = SerializationFormat::Json.encode(&value).unwrap();
//! let back: BTreeMap<String, i64> = SerializationFormat::Json.decode(&bytes).unwrap();
//! assert_eq!(back, value);
//! ```

use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Human-readable JSON (default)
    #[default]
    Json,
    /// Compact binary MessagePack
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Serialize `value` to bytes
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Json => serde_json::to_vec(value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
        }
    }

    /// Serialize `value` by appending to `out`
    pub fn encode_into<T: Serialize>(self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        match self {
            SerializationFormat::Json => serde_json::to_writer(out, value)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::MessagePack => {
                let mut serializer = rmp_serde::Serializer::new(out).with_struct_map();
                value
                    .serialize(&mut serializer)
                    .map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Deserialize a value from bytes
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_format_names() {
        assert_eq!(SerializationFormat::Json.name(), "JSON");
        assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Json);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_free_form_value_both_formats() {
        let value = json!({"Commands": [{"Command": "Ping-Test", "Payload": {"n": 3}}]});
        for format in [SerializationFormat::Json, SerializationFormat::MessagePack] {
            let bytes = format.encode(&value).expect("serialize");
            let recovered: Value = format.decode(&bytes).expect("deserialize");
            assert_eq!(recovered, value, "{} roundtrip", format.name());
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_format_sizes() {
        let value = json!({"Ping": 1_700_000_000_000i64});
        let json_size = SerializationFormat::Json.encode(&value).expect("json").len();
        let msgpack_size = SerializationFormat::MessagePack
            .encode(&value)
            .expect("msgpack")
            .len();
        assert!(msgpack_size < json_size);
    }

    #[test]
    fn test_garbage_rejected() {
        let result: Result<Value> = SerializationFormat::Json.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }
}
