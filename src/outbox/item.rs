//! Outbox rows and their derived lifecycle status.

use crate::constants::properties;
use crate::envelope::{Envelope, EnvelopeId, EnvelopeType};
use crate::serialization::{payload_hash, SerializationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle position of an [`OutboxItem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for a worker, possibly after failed tries
    Pending,
    /// Held by a worker for the current tick
    Claimed,
    /// Published successfully
    Processed,
    /// Out of retries or undecodable; kept for inspection
    Abandoned,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Processed => "processed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// A persisted envelope awaiting forwarding to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: Uuid,
    pub envelope_id: Uuid,
    pub envelope_type: String,
    pub payload: Vec<u8>,
    /// Lowercase hex SHA-256 of `payload`
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub properties: HashMap<String, String>,
}

impl OutboxItem {
    /// Capture an envelope as a new pending row
    pub fn from_envelope(envelope: &Envelope, max_retries: u32) -> Self {
        let mut item_properties = envelope.properties().clone();
        if let Some(ttl) = envelope.ttl() {
            item_properties.insert(properties::TTL_MS.to_string(), ttl.as_millis().to_string());
        }

        Self {
            id: Uuid::new_v4(),
            envelope_id: envelope.id().as_uuid(),
            envelope_type: envelope.envelope_type().to_string(),
            payload: envelope.payload().to_vec(),
            payload_hash: payload_hash(envelope.payload()),
            created_at: envelope.created_at(),
            claimed_at: None,
            claimed_by: None,
            processed_at: None,
            abandoned_at: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            properties: item_properties,
        }
    }

    /// Rebuild the envelope this row was written from
    ///
    /// The returned envelope carries the row id under `courier.outbox_item_id`
    /// so handlers can deduplicate redeliveries.
    pub fn to_envelope(&self) -> Result<Envelope, SerializationError> {
        let mut envelope_properties = self.properties.clone();
        let ttl = match envelope_properties.remove(properties::TTL_MS) {
            Some(raw) => Some(raw.parse::<u64>().map(Duration::from_millis).map_err(|e| {
                SerializationError::Deserialize {
                    type_name: "OutboxItem".to_string(),
                    message: format!("invalid {} property '{raw}': {e}", properties::TTL_MS),
                }
            })?),
            None => None,
        };

        let mut builder = Envelope::builder(
            EnvelopeType::new(self.envelope_type.clone()),
            self.payload.clone(),
        )
        .id(EnvelopeId::from_uuid(self.envelope_id))
        .created_at(self.created_at)
        .properties(envelope_properties)
        .property(properties::OUTBOX_ITEM_ID, self.id.to_string());

        if let Some(ttl) = ttl {
            builder = builder.ttl(ttl);
        }

        Ok(builder.build())
    }

    pub fn status(&self) -> OutboxStatus {
        if self.abandoned_at.is_some() {
            OutboxStatus::Abandoned
        } else if self.processed_at.is_some() {
            OutboxStatus::Processed
        } else if self.claimed_at.is_some() {
            OutboxStatus::Claimed
        } else {
            OutboxStatus::Pending
        }
    }

    /// Unsettled and either unclaimed or holding a claim older than `claim_timeout`
    pub fn is_claimable(&self, now: DateTime<Utc>, claim_timeout: Duration) -> bool {
        if self.processed_at.is_some() || self.abandoned_at.is_some() {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(claimed_at) => match chrono::Duration::from_std(claim_timeout) {
                Ok(timeout) => claimed_at
                    .checked_add_signed(timeout)
                    .is_some_and(|deadline| deadline < now),
                Err(_) => false,
            },
        }
    }

    /// Whether `worker_id` holds the current claim on an unsettled row
    ///
    /// Settlement is only allowed while this holds: once a stale claim is
    /// taken over, the previous holder can no longer change the row.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.processed_at.is_none()
            && self.abandoned_at.is_none()
            && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Whether the retry budget is spent
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

/// Row counts per lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub processed: u64,
    pub abandoned: u64,
}

impl OutboxStatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.processed + self.abandoned
    }

    pub(crate) fn add(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Claimed => self.claimed += 1,
            OutboxStatus::Processed => self.processed += 1,
            OutboxStatus::Abandoned => self.abandoned += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::verify_payload_hash;

    fn envelope() -> Envelope {
        Envelope::builder("OrderPlaced", br#"{"id":7}"#.to_vec())
            .correlation_id("corr-7")
            .ttl(Duration::from_secs(30))
            .build()
    }

    #[test]
    fn test_from_envelope_starts_pending() {
        let source = envelope();
        let item = OutboxItem::from_envelope(&source, 3);

        assert_eq!(item.status(), OutboxStatus::Pending);
        assert_eq!(item.envelope_id, source.id().as_uuid());
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.properties["courier.ttl_ms"], "30000");
        assert!(verify_payload_hash(&item.payload, &item.payload_hash).is_ok());
    }

    #[test]
    fn test_to_envelope_restores_identity_and_ttl() {
        let source = envelope();
        let item = OutboxItem::from_envelope(&source, 3);
        let rebuilt = item.to_envelope().unwrap();

        assert_eq!(rebuilt.id(), source.id());
        assert_eq!(rebuilt.created_at(), source.created_at());
        assert_eq!(rebuilt.ttl(), Some(Duration::from_secs(30)));
        assert_eq!(rebuilt.correlation_id(), Some("corr-7"));
        assert_eq!(rebuilt.property("courier.ttl_ms"), None);
        assert_eq!(
            rebuilt.property("courier.outbox_item_id"),
            Some(item.id.to_string().as_str())
        );
    }

    #[test]
    fn test_application_ttl_property_survives_round_trip() {
        let source = Envelope::builder("OrderPlaced", b"{}".to_vec())
            .property("ttl_ms", "customer-chosen")
            .build();
        let rebuilt = OutboxItem::from_envelope(&source, 3).to_envelope().unwrap();

        assert_eq!(rebuilt.ttl(), None);
        assert_eq!(rebuilt.property("ttl_ms"), Some("customer-chosen"));
    }

    #[test]
    fn test_claim_ownership() {
        let mut item = OutboxItem::from_envelope(&envelope(), 3);
        assert!(!item.is_claimed_by("w1"));

        item.claimed_at = Some(Utc::now());
        item.claimed_by = Some("w1".to_string());
        assert!(item.is_claimed_by("w1"));
        assert!(!item.is_claimed_by("w2"));

        item.processed_at = Some(Utc::now());
        assert!(!item.is_claimed_by("w1"));
    }

    #[test]
    fn test_invalid_ttl_property_is_rejected() {
        let mut item = OutboxItem::from_envelope(&envelope(), 3);
        item.properties.insert("courier.ttl_ms".to_string(), "soon".to_string());
        assert!(item.to_envelope().is_err());
    }

    #[test]
    fn test_status_precedence() {
        let now = Utc::now();
        let mut item = OutboxItem::from_envelope(&envelope(), 3);

        item.claimed_at = Some(now);
        assert_eq!(item.status(), OutboxStatus::Claimed);
        item.processed_at = Some(now);
        assert_eq!(item.status(), OutboxStatus::Processed);
        item.abandoned_at = Some(now);
        assert_eq!(item.status(), OutboxStatus::Abandoned);
    }

    #[test]
    fn test_stale_claim_is_claimable() {
        let now = Utc::now();
        let mut item = OutboxItem::from_envelope(&envelope(), 3);
        let timeout = Duration::from_secs(60);

        assert!(item.is_claimable(now, timeout));

        item.claimed_at = Some(now - chrono::Duration::seconds(10));
        assert!(!item.is_claimable(now, timeout));

        item.claimed_at = Some(now - chrono::Duration::seconds(120));
        assert!(item.is_claimable(now, timeout));

        item.processed_at = Some(now);
        assert!(!item.is_claimable(now, timeout));
    }

    #[test]
    fn test_retry_budget_uses_strict_excess() {
        let mut item = OutboxItem::from_envelope(&envelope(), 2);
        item.retry_count = 2;
        assert!(!item.retries_exhausted());
        item.retry_count = 3;
        assert!(item.retries_exhausted());
    }
}
