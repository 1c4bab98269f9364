//! The persistence contract behind the outbox worker.

use super::item::{OutboxItem, OutboxStatus, OutboxStatusCounts};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Durable storage for outbox rows
///
/// `claim_batch` must be atomic across concurrent callers: no row may be
/// returned to two claimants unless the first claim is older than
/// `claim_timeout`. Rows are never deleted except through the purge methods.
///
/// Every settlement call names the worker that claimed the row. It only
/// applies while that worker still holds the claim on an unsettled row;
/// otherwise it changes nothing and fails with
/// [`CourierError::ClaimLost`](crate::error::CourierError::ClaimLost).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, item: OutboxItem) -> Result<()>;

    /// All-or-nothing insert
    async fn insert_many(&self, items: Vec<OutboxItem>) -> Result<()>;

    /// Claim up to `max` claimable rows, oldest first
    async fn claim_batch(
        &self,
        max: usize,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<Vec<OutboxItem>>;

    async fn mark_processed(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Count a failed try and release the claim; abandons the row once
    /// `retry_count` exceeds `max_retries`
    async fn mark_failed(&self, id: Uuid, worker_id: &str, reason: &str)
        -> Result<OutboxStatus>;

    /// Settle the row as permanently failed without touching `retry_count`
    async fn mark_abandoned(&self, id: Uuid, worker_id: &str, reason: &str) -> Result<()>;

    /// Return a claimed row to pending without counting a try
    async fn release_claim(&self, id: Uuid, worker_id: &str) -> Result<()>;

    /// Delete processed rows, or every row when `only_processed` is false
    async fn purge(&self, only_processed: bool) -> Result<u64>;

    async fn purge_processed_older_than(&self, age: Duration) -> Result<u64>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxItem>>;

    async fn count_by_status(&self) -> Result<OutboxStatusCounts>;
}
