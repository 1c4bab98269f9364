//! # In-Memory Outbox Store
//!
//! Process-local [`OutboxStore`] for tests and single-process deployments.
//! Every operation runs inside one mutex-guarded critical section, which is
//! what makes `claim_batch` atomic across concurrent workers sharing the store.

use super::item::{OutboxItem, OutboxStatus, OutboxStatusCounts};
use super::store::OutboxStore;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    items: Mutex<HashMap<Uuid, OutboxItem>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row, oldest first
    pub fn snapshot(&self) -> Vec<OutboxItem> {
        let mut items: Vec<OutboxItem> = self.items.lock().values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Apply `f` only while `worker_id` owns the claim on an unsettled row
    fn with_claimed_item<T>(
        &self,
        id: Uuid,
        worker_id: &str,
        f: impl FnOnce(&mut OutboxItem) -> T,
    ) -> Result<T> {
        let mut items = self.items.lock();
        let item = items.get_mut(&id).ok_or_else(|| CourierError::not_found(id))?;
        if !item.is_claimed_by(worker_id) {
            return Err(CourierError::claim_lost(id, worker_id));
        }
        Ok(f(item))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, item: OutboxItem) -> Result<()> {
        let mut items = self.items.lock();
        if items.contains_key(&item.id) {
            return Err(CourierError::store(
                "insert",
                format!("duplicate outbox item id {}", item.id),
            ));
        }
        items.insert(item.id, item);
        Ok(())
    }

    async fn insert_many(&self, batch: Vec<OutboxItem>) -> Result<()> {
        let mut items = self.items.lock();

        let mut seen = std::collections::HashSet::with_capacity(batch.len());
        for item in &batch {
            if items.contains_key(&item.id) || !seen.insert(item.id) {
                return Err(CourierError::store(
                    "insert_many",
                    format!("duplicate outbox item id {}", item.id),
                ));
            }
        }

        for item in batch {
            items.insert(item.id, item);
        }
        Ok(())
    }

    async fn claim_batch(
        &self,
        max: usize,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<Vec<OutboxItem>> {
        let now = Utc::now();
        let mut items = self.items.lock();

        let mut candidates: Vec<&mut OutboxItem> = items
            .values_mut()
            .filter(|item| item.is_claimable(now, claim_timeout))
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let claimed: Vec<OutboxItem> = candidates
            .into_iter()
            .take(max)
            .map(|item| {
                if let Some(previous) = item.claimed_by.as_deref() {
                    debug!(
                        item_id = %item.id,
                        previous_worker = %previous,
                        "Reclaiming stale claim"
                    );
                }
                item.claimed_at = Some(now);
                item.claimed_by = Some(worker_id.to_string());
                item.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid, worker_id: &str) -> Result<()> {
        self.with_claimed_item(id, worker_id, |item| {
            item.processed_at = Some(Utc::now());
            item.claimed_at = None;
            item.claimed_by = None;
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<OutboxStatus> {
        self.with_claimed_item(id, worker_id, |item| {
            item.retry_count += 1;
            item.last_error = Some(reason.to_string());
            item.claimed_at = None;
            item.claimed_by = None;
            if item.retries_exhausted() {
                item.abandoned_at = Some(Utc::now());
            }
            item.status()
        })
    }

    async fn mark_abandoned(&self, id: Uuid, worker_id: &str, reason: &str) -> Result<()> {
        self.with_claimed_item(id, worker_id, |item| {
            item.abandoned_at = Some(Utc::now());
            item.last_error = Some(reason.to_string());
            item.claimed_at = None;
            item.claimed_by = None;
        })
    }

    async fn release_claim(&self, id: Uuid, worker_id: &str) -> Result<()> {
        self.with_claimed_item(id, worker_id, |item| {
            item.claimed_at = None;
            item.claimed_by = None;
        })
    }

    async fn purge(&self, only_processed: bool) -> Result<u64> {
        let mut items = self.items.lock();
        let before = items.len();
        if only_processed {
            items.retain(|_, item| item.processed_at.is_none());
        } else {
            items.clear();
        }
        Ok((before - items.len()) as u64)
    }

    async fn purge_processed_older_than(&self, age: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| CourierError::store("purge_processed_older_than", e.to_string()))?;
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };

        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|_, item| !item.processed_at.is_some_and(|at| at < cutoff));
        Ok((before - items.len()) as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxItem>> {
        Ok(self.items.lock().get(&id).cloned())
    }

    async fn count_by_status(&self) -> Result<OutboxStatusCounts> {
        let mut counts = OutboxStatusCounts::default();
        for item in self.items.lock().values() {
            counts.add(item.status());
        }
        Ok(counts)
    }
}
