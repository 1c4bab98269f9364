//! # Payload Serialization
//!
//! The core is format-agnostic: anything that moves payloads to and from bytes
//! goes through the [`Serializer`] trait. [`JsonSerializer`] is the default,
//! backed by `serde_json`.
//!
//! Also hosts [`payload_hash`], the SHA-256 digest recorded next to every
//! outbox payload so a corrupted row is detected before it is dispatched.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SerializationError {
    #[error("Failed to serialize {type_name}: {message}")]
    Serialize { type_name: String, message: String },

    #[error("Failed to deserialize {type_name}: {message}")]
    Deserialize { type_name: String, message: String },

    #[error("No payload type registered for '{type_name}'")]
    UnknownType { type_name: String },

    #[error("Payload hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Turns values into bytes and back
pub trait Serializer: Send + Sync + Clone + 'static {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;

    /// MIME type stored in the envelope property bag
    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Serialize {
            type_name: std::any::type_name::<T>().to_string(),
            message: e.to_string(),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Deserialize {
            type_name: std::any::type_name::<T>().to_string(),
            message: e.to_string(),
        })
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Lowercase hex SHA-256 of a payload
pub fn payload_hash(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Check a payload against its recorded hash
pub fn verify_payload_hash(payload: &[u8], expected: &str) -> Result<(), SerializationError> {
    let actual = payload_hash(payload);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(SerializationError::HashMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
