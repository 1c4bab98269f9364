//! # Transport Binding
//!
//! The contract an external topic/queue transport implements on top of a
//! [`MessageBroker`]: how an [`Envelope`] maps onto a [`WireMessage`], and how a
//! publish result maps onto an acknowledge/abandon decision.
//!
//! ## Wire layout
//!
//! | Envelope            | Wire message                       |
//! |---------------------|------------------------------------|
//! | `envelope_type`     | `subject` and `x-message-type`     |
//! | `id`                | `message_id`                       |
//! | `payload`           | `body`                             |
//! | `created_at`        | `x-created-at` (RFC 3339)          |
//! | correlation id      | `x-correlation-id`                 |
//! | `ttl`               | `x-ttl-ms`                         |
//! | property `k`        | `x-prop-k`                         |
//!
//! The correlation id comes from the envelope's `correlation_id` property.
//! Without one, the id of the current tracing span is used, so every message
//! published inside one request span shares an id. Outside any span a fresh
//! UUID is generated.

use crate::broker::{MessageBroker, PublishOptions};
use crate::constants::{headers, properties};
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::Result;
use crate::serialization::SerializationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Span};
use uuid::Uuid;

/// Transport-neutral message as handed to a topic or queue client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub subject: String,
    pub message_id: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl WireMessage {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let mut wire_headers = HashMap::with_capacity(envelope.properties().len() + 4);

        wire_headers.insert(
            headers::MESSAGE_TYPE.to_string(),
            envelope.envelope_type().to_string(),
        );
        wire_headers.insert(
            headers::CREATED_AT.to_string(),
            envelope.created_at().to_rfc3339(),
        );

        let correlation_id = envelope
            .correlation_id()
            .map(str::to_string)
            .or_else(ambient_correlation_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        wire_headers.insert(headers::CORRELATION_ID.to_string(), correlation_id);

        for (key, value) in envelope.properties() {
            if key == properties::CORRELATION_ID {
                continue;
            }
            wire_headers.insert(format!("{}{key}", headers::PROPERTY_PREFIX), value.clone());
        }

        if let Some(ttl) = envelope.ttl() {
            wire_headers.insert(headers::TTL_MS.to_string(), ttl.as_millis().to_string());
        }

        Self {
            subject: envelope.envelope_type().to_string(),
            message_id: envelope.id().to_string(),
            body: envelope.payload().to_vec(),
            headers: wire_headers,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(headers::CORRELATION_ID).map(String::as_str)
    }

    /// Rebuild the envelope on the receiving side
    pub fn into_envelope(self) -> std::result::Result<Envelope, SerializationError> {
        let id = Uuid::parse_str(&self.message_id)
            .map(EnvelopeId::from_uuid)
            .map_err(|e| wire_error(format!("invalid message id '{}': {e}", self.message_id)))?;

        let created_at = match self.headers.get(headers::CREATED_AT) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| wire_error(format!("invalid created-at header '{raw}': {e}")))?,
            None => Utc::now(),
        };

        let mut builder = Envelope::builder(self.subject, self.body)
            .id(id)
            .created_at(created_at);

        for (key, value) in self.headers {
            if key == headers::TTL_MS {
                let millis: u64 = value
                    .parse()
                    .map_err(|e| wire_error(format!("invalid ttl header '{value}': {e}")))?;
                builder = builder.ttl(Duration::from_millis(millis));
            } else if key == headers::CORRELATION_ID {
                builder = builder.correlation_id(value);
            } else if let Some(property) = key.strip_prefix(headers::PROPERTY_PREFIX) {
                builder = builder.property(property, value);
            }
        }

        Ok(builder.build())
    }
}

/// Correlation id derived from the span the caller is running in
fn ambient_correlation_id() -> Option<String> {
    Span::current()
        .id()
        .map(|id| format!("span-{:016x}", id.into_u64()))
}

fn wire_error(message: String) -> SerializationError {
    SerializationError::Deserialize {
        type_name: "WireMessage".to_string(),
        message,
    }
}

/// Settlement decision reported back to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportDisposition {
    /// Remove the message from the queue
    Acknowledge,
    /// Return the message for redelivery (or dead-lettering by the backend)
    Abandon,
}

impl TransportDisposition {
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Acknowledge,
            Err(_) => Self::Abandon,
        }
    }
}

/// Receive path of a transport: decode, publish with failures propagated, settle
pub async fn deliver(
    broker: &dyn MessageBroker,
    message: WireMessage,
    cancellation: &CancellationToken,
) -> TransportDisposition {
    let message_id = message.message_id.clone();
    let envelope = match message.into_envelope() {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(message_id = %message_id, error = %error, "Undecodable wire message");
            return TransportDisposition::Abandon;
        }
    };

    let result = broker
        .publish_with(&envelope, cancellation, PublishOptions::propagating())
        .await;
    let disposition = TransportDisposition::from_result(&result);

    debug!(
        message_id = %message_id,
        envelope_type = %envelope.envelope_type(),
        disposition = ?disposition,
        "Settled wire message"
    );
    disposition
}
