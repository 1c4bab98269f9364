//! # Transactional Outbox
//!
//! At-least-once forwarding of envelopes that were persisted together with a
//! business state change.
//!
//! ## Architecture
//!
//! ```text
//! business transaction ──▶ OutboxWriter ──▶ OutboxStore ◀── OutboxWorker ──▶ MessageBroker
//!                               │                               ▲
//!                               └──── OutboxSignal (immediate) ─┘
//! ```
//!
//! ## Item lifecycle
//!
//! ```text
//! Pending ──claim──▶ Claimed ──publish ok──▶ Processed
//!    ▲                  │
//!    ├── mark_failed ───┤ (retry_count + 1, while retry_count <= max_retries)
//!    ├── release_claim ─┤ (shutdown, retry_count unchanged)
//!    │                  └── mark_failed / mark_abandoned ──▶ Abandoned
//!    └── claim older than claim_timeout is claimable again
//! ```
//!
//! Rows are never deleted except by explicit purge: at startup (all rows or
//! processed rows) or by retention age.

mod in_memory;
mod item;
#[cfg(feature = "postgres")]
mod postgres;
mod store;
mod worker;
mod writer;

pub use in_memory::InMemoryOutboxStore;
pub use item::{OutboxItem, OutboxStatus, OutboxStatusCounts};
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;
pub use store::OutboxStore;
pub use worker::{OutboxWorker, OutboxWorkerHandle, TickReport};
pub use writer::OutboxWriter;

use std::sync::Arc;
use tokio::sync::Notify;

/// Wake-up channel from writers to the worker in immediate mode
///
/// Holds at most one pending wake-up. A lost or coalesced signal only delays
/// processing until the next scheduled tick.
#[derive(Debug, Clone, Default)]
pub struct OutboxSignal(Arc<Notify>);

impl OutboxSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}
