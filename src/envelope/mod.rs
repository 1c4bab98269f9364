//! # Envelope
//!
//! The unit of delivery. An [`Envelope`] carries a stable logical type name, an
//! opaque payload, identity, creation time, an optional time-to-live and a
//! string-keyed property bag for cross-cutting metadata such as correlation ids.
//!
//! Envelopes are immutable once built; [`EnvelopeBuilder`] is the only way to
//! set fields.

pub mod registry;

pub use registry::PayloadRegistry;

use crate::constants::properties;
use crate::serialization::{SerializationError, Serializer};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of an envelope instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable logical name of a payload shape, e.g. `OrderPlaced`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeType(String);

impl EnvelopeType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EnvelopeType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A payload that can be published
///
/// `TYPE` is the stable name recorded on the wire and in the outbox; it must
/// map to exactly one payload shape.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    fn envelope_type() -> EnvelopeType {
        EnvelopeType::new(Self::TYPE)
    }
}

/// Immutable unit of delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    envelope_type: EnvelopeType,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
    properties: HashMap<String, String>,
}

impl Envelope {
    /// Start building an envelope around raw payload bytes
    pub fn builder(envelope_type: impl Into<EnvelopeType>, payload: Vec<u8>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            id: None,
            envelope_type: envelope_type.into(),
            payload,
            created_at: None,
            ttl: None,
            properties: HashMap::new(),
        }
    }

    /// Serialize a message into a fresh envelope
    pub fn from_message<M: Message, S: Serializer>(
        message: &M,
        serializer: &S,
    ) -> Result<Self, SerializationError> {
        Ok(Self::message_builder(message, serializer)?.build())
    }

    /// Serialize a message and return the builder for further customization
    pub fn message_builder<M: Message, S: Serializer>(
        message: &M,
        serializer: &S,
    ) -> Result<EnvelopeBuilder, SerializationError> {
        let payload = serializer.serialize(message)?;
        Ok(Self::builder(M::envelope_type(), payload)
            .property(properties::CONTENT_TYPE, serializer.content_type()))
    }

    /// Reconstruct the typed payload
    pub fn decode<M: Message, S: Serializer>(
        &self,
        serializer: &S,
    ) -> Result<M, SerializationError> {
        if self.envelope_type.as_str() != M::TYPE {
            return Err(SerializationError::Deserialize {
                type_name: M::TYPE.to_string(),
                message: format!("envelope carries type '{}'", self.envelope_type),
            });
        }
        serializer.deserialize(&self.payload)
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn envelope_type(&self) -> &EnvelopeType {
        &self.envelope_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.property(properties::CORRELATION_ID)
    }

    /// Moment after which the envelope must not be dispatched
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    /// `now > created_at + ttl`; envelopes without a TTL never expire
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => false,
            // TTL too large to represent never expires
            Some(_) => self.expires_at().is_some_and(|deadline| now > deadline),
        }
    }
}

/// Builder for [`Envelope`]
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    id: Option<EnvelopeId>,
    envelope_type: EnvelopeType,
    payload: Vec<u8>,
    created_at: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    properties: HashMap<String, String>,
}

impl EnvelopeBuilder {
    pub fn id(mut self, id: EnvelopeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn correlation_id(self, id: impl Into<String>) -> Self {
        self.property(properties::CORRELATION_ID, id)
    }

    pub fn build(self) -> Envelope {
        Envelope {
            id: self.id.unwrap_or_default(),
            envelope_type: self.envelope_type,
            payload: self.payload,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            ttl: self.ttl,
            properties: self.properties,
        }
    }
}
