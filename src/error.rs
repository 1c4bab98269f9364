//! # Error Types
//!
//! Crate-level error handling using thiserror for structured error types.
//! Handler-level failures live in [`crate::handler::HandlerError`]; this module
//! covers everything that can go wrong around them (stores, configuration,
//! serialization, failure propagation out of `publish`).

use crate::config::ConfigurationError;
use crate::handler::HandlerError;
use crate::pipeline::AttemptRecord;
use crate::serialization::SerializationError;
use thiserror::Error;

/// A single handler failure collected while publishing one envelope
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub handler_type: String,
    pub error: HandlerError,
    /// Failed tries recorded by the retry behavior, oldest first
    pub attempts: Vec<AttemptRecord>,
}

impl HandlerFailure {
    pub fn new(handler_type: impl Into<String>, error: HandlerError) -> Self {
        Self {
            handler_type: handler_type.into(),
            error,
            attempts: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    fn attempt_reasons(&self) -> Vec<String> {
        if self.attempts.is_empty() {
            return vec![self.to_string()];
        }
        self.attempts
            .iter()
            .map(|a| format!("{} attempt {}: {}", self.handler_type, a.attempt, a.error))
            .collect()
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.handler_type, self.error)
    }
}

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Outbox store error: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error(
        "{} handler(s) failed for envelope type {envelope_type}: {}",
        failures.len(),
        join_failures(failures)
    )]
    HandlerFailures {
        envelope_type: String,
        failures: Vec<HandlerFailure>,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Outbox item not found: {id}")]
    NotFound { id: String },

    /// The row is no longer claimed by this worker, or was already settled
    #[error("Outbox item {id} is no longer claimed by {worker_id}")]
    ClaimLost { id: String, worker_id: String },

    /// The background task ended abnormally
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn join_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CourierError {
    /// Create a store error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn claim_lost(id: impl ToString, worker_id: impl Into<String>) -> Self {
        Self::ClaimLost {
            id: id.to_string(),
            worker_id: worker_id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when every collected handler failure was a cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::HandlerFailures { failures, .. } => {
                !failures.is_empty()
                    && failures
                        .iter()
                        .all(|f| matches!(f.error, HandlerError::Cancelled))
            }
            _ => false,
        }
    }

    pub fn is_claim_lost(&self) -> bool {
        matches!(self, Self::ClaimLost { .. })
    }

    /// Reason recorded on a failed outbox row
    ///
    /// Handler failures list every failed attempt of every handler.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::HandlerFailures {
                envelope_type,
                failures,
            } => {
                let reasons: Vec<String> =
                    failures.iter().flat_map(HandlerFailure::attempt_reasons).collect();
                format!("{envelope_type}: {}", reasons.join("; "))
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_failures_display_lists_every_handler() {
        let err = CourierError::HandlerFailures {
            envelope_type: "OrderPlaced".to_string(),
            failures: vec![
                HandlerFailure::new("UpdateInventory", HandlerError::failed("stock service down")),
                HandlerFailure::new("SendConfirmation", HandlerError::Cancelled),
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("2 handler(s) failed for envelope type OrderPlaced"));
        assert!(msg.contains("UpdateInventory: Handler failed: stock service down"));
        assert!(msg.contains("SendConfirmation"));
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(CourierError::cancelled("tick").is_cancellation());

        let only_cancelled = CourierError::HandlerFailures {
            envelope_type: "A".to_string(),
            failures: vec![HandlerFailure::new("H", HandlerError::Cancelled)],
        };
        assert!(only_cancelled.is_cancellation());

        let mixed = CourierError::HandlerFailures {
            envelope_type: "A".to_string(),
            failures: vec![
                HandlerFailure::new("H", HandlerError::Cancelled),
                HandlerFailure::new("G", HandlerError::failed("boom")),
            ],
        };
        assert!(!mixed.is_cancellation());
        assert!(!CourierError::store("claim", "down").is_cancellation());
    }

    #[test]
    fn test_failure_reason_lists_each_attempt() {
        let record = |attempt, error: &str| AttemptRecord {
            attempt,
            error: error.to_string(),
            timed_out: false,
            elapsed_ms: 0,
        };
        let err = CourierError::HandlerFailures {
            envelope_type: "OrderPlaced".to_string(),
            failures: vec![
                HandlerFailure::new("UpdateInventory", HandlerError::failed("still down"))
                    .with_attempts(vec![record(1, "timeout"), record(2, "still down")]),
                HandlerFailure::new("Audit", HandlerError::failed("disk full")),
            ],
        };

        assert_eq!(
            err.failure_reason(),
            "OrderPlaced: UpdateInventory attempt 1: timeout; \
             UpdateInventory attempt 2: still down; \
             Audit: Handler failed: disk full"
        );
        assert_eq!(
            CourierError::store("claim", "down").failure_reason(),
            "Outbox store error: claim: down"
        );
    }

    #[test]
    fn test_claim_lost_is_distinct() {
        let err = CourierError::claim_lost("42", "worker-a");
        assert!(err.is_claim_lost());
        assert!(!err.is_cancellation());
        assert_eq!(err.to_string(), "Outbox item 42 is no longer claimed by worker-a");
        assert!(!CourierError::not_found("42").is_claim_lost());
    }
}
