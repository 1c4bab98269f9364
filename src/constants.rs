//! # System Constants
//!
//! Well-known property keys and operational defaults shared by the broker,
//! the outbox and the transport binding.

/// Keys used in the envelope property bag
///
/// Keys under [`RESERVED_PREFIX`](properties::RESERVED_PREFIX) belong to the
/// crate; application properties outside it are carried untouched.
pub mod properties {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const CONTENT_TYPE: &str = "content_type";

    pub const RESERVED_PREFIX: &str = "courier.";
    /// Envelope TTL carried through the outbox, in milliseconds
    pub const TTL_MS: &str = "courier.ttl_ms";
    /// Outbox item id attached to envelopes forwarded by the worker
    pub const OUTBOX_ITEM_ID: &str = "courier.outbox_item_id";
}

/// Header names used when binding envelopes to wire messages
pub mod headers {
    pub const MESSAGE_TYPE: &str = "x-message-type";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    pub const CREATED_AT: &str = "x-created-at";
    pub const TTL_MS: &str = "x-ttl-ms";
    pub const PROPERTY_PREFIX: &str = "x-prop-";
}

/// Operational defaults
pub mod defaults {
    pub const STARTUP_DELAY_MS: u64 = 5_000;
    pub const PROCESSING_INTERVAL_MS: u64 = 30_000;
    pub const PROCESSING_DELAY_MS: u64 = 0;
    pub const PROCESSING_COUNT: usize = 100;
    pub const MAX_RETRIES: u32 = 3;
    pub const CLAIM_TIMEOUT_MS: u64 = 300_000;

    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF_MS: u64 = 100;

    /// Jitter bounds applied to exponential backoff delays
    pub const JITTER_MIN: f64 = 0.85;
    pub const JITTER_MAX: f64 = 1.15;
}

/// Recognized environment names
pub mod environments {
    pub const DEVELOPMENT: &str = "development";
    pub const TEST: &str = "test";
    pub const PRODUCTION: &str = "production";
}
