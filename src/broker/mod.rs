//! # Message Broker
//!
//! Fans a published [`Envelope`] out to every subscribed handler, each wrapped
//! in the behavior [`Pipeline`](crate::pipeline::Pipeline).
//!
//! ## Overview
//!
//! - **Snapshot dispatch**: handlers are matched from the subscriptions present
//!   when `publish` is called
//! - **Isolation**: one handler failing, timing out or panicking never prevents
//!   another from running
//! - **Settled completion**: `publish` returns once every matched handler has
//!   succeeded or exhausted its failure policy
//! - **TTL expiry**: expired envelopes are dropped before any invocation
//!
//! ## Usage
//!
//! ```rust
//! use courier_core::broker::{InProcessBroker, MessageBroker, PublishReport};
//! use courier_core::config::BrokerConfig;
//! use courier_core::envelope::Envelope;
//! use courier_core::registry::RegistryHandlerFactory;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> courier_core::error::Result<()> {
//! let broker = InProcessBroker::from_config(
//!     Arc::new(RegistryHandlerFactory::new()),
//!     &BrokerConfig::default(),
//! );
//!
//! let envelope = Envelope::builder("OrderPlaced", b"{}".to_vec()).build();
//! let report = broker.publish(&envelope, &CancellationToken::new()).await?;
//! assert!(matches!(report, PublishReport::NoSubscribers));
//! # Ok(())
//! # }
//! ```

mod in_process;

pub use in_process::InProcessBroker;

use crate::envelope::{Envelope, EnvelopeType};
use crate::error::{HandlerFailure, Result};
use crate::handler::{HandlerResult, HandlerType};
use crate::pipeline::AttemptRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Publish/subscribe surface shared by broker implementations
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Returns `true` when the subscription is new
    fn subscribe(&self, envelope_type: EnvelopeType, handler_type: HandlerType) -> bool;

    /// Returns `true` when a subscription was removed
    fn unsubscribe(&self, envelope_type: &EnvelopeType, handler_type: &HandlerType) -> bool;

    async fn publish_with(
        &self,
        envelope: &Envelope,
        cancellation: &CancellationToken,
        options: PublishOptions,
    ) -> Result<PublishReport>;

    /// Publish with failures reported in the returned [`PublishReport`]
    async fn publish(
        &self,
        envelope: &Envelope,
        cancellation: &CancellationToken,
    ) -> Result<PublishReport> {
        self.publish_with(envelope, cancellation, PublishOptions::default())
            .await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Turn any handler failure into
    /// [`CourierError::HandlerFailures`](crate::error::CourierError::HandlerFailures)
    pub propagate_failures: bool,
}

impl PublishOptions {
    pub fn propagating() -> Self {
        Self {
            propagate_failures: true,
        }
    }
}

/// Outcome of one handler's invocation
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReport {
    pub handler_type: HandlerType,
    pub outcome: HandlerResult,
    /// Failed tries, in order
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl HandlerReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// What a publish did
#[derive(Debug, Clone, PartialEq)]
pub enum PublishReport {
    /// TTL elapsed before dispatch; no handler ran
    Expired,
    NoSubscribers,
    /// One report per matched handler, in subscription order
    Delivered(Vec<HandlerReport>),
}

impl PublishReport {
    pub fn handler_reports(&self) -> &[HandlerReport] {
        match self {
            Self::Delivered(reports) => reports,
            _ => &[],
        }
    }

    pub fn failures(&self) -> Vec<HandlerFailure> {
        self.handler_reports()
            .iter()
            .filter_map(|report| {
                report.outcome.as_ref().err().map(|error| {
                    HandlerFailure::new(report.handler_type.to_string(), error.clone())
                        .with_attempts(report.attempts.clone())
                })
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.handler_reports().iter().all(HandlerReport::succeeded)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// Lock-free broker counters
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

impl BrokerStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, count: u64) {
        self.delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BrokerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStatsSnapshot {
    /// `publish` calls, including expired and unmatched ones
    pub published: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Handler invocations that settled with a failure
    pub failed: u64,
    /// Envelopes dropped for TTL expiry
    pub expired: u64,
}
