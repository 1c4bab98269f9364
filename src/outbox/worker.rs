//! # Outbox Worker
//!
//! Background loop that drains the [`OutboxStore`] into a [`MessageBroker`].
//!
//! ## Overview
//!
//! Each tick claims up to `processing_count` rows (oldest first), forwards them
//! one at a time through `publish_with(propagate_failures = true)` and settles
//! every row: processed, failed (counted retry), abandoned, or released.
//! A failure on one row is logged and never aborts the batch or the loop.
//!
//! Settlement is conditional on this worker still owning the claim. When a
//! slow tick outlives `claim_timeout` and another worker takes the row over,
//! the late settlement is logged, counted in [`TickReport::lost_claims`] and
//! dropped.
//!
//! Ticks never overlap: the loop runs them sequentially with
//! `MissedTickBehavior::Skip`, and an explicit [`OutboxWorker::tick`] call made
//! while another tick holds the run guard returns a skipped report instead of
//! queueing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::broker::InProcessBroker;
//! use courier_core::config::CourierConfig;
//! use courier_core::envelope::PayloadRegistry;
//! use courier_core::outbox::{InMemoryOutboxStore, OutboxWorker};
//! use courier_core::registry::RegistryHandlerFactory;
//! use std::sync::Arc;
//!
//! # async fn example() -> courier_core::error::Result<()> {
//! let config = CourierConfig::default();
//! let broker = Arc::new(InProcessBroker::from_config(
//!     Arc::new(RegistryHandlerFactory::new()),
//!     &config.broker,
//! ));
//! let worker = Arc::new(OutboxWorker::new(
//!     Arc::new(InMemoryOutboxStore::new()),
//!     broker,
//!     Arc::new(PayloadRegistry::new()),
//!     config.outbox.clone(),
//! )?);
//!
//! let handle = worker.start();
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use super::item::{OutboxItem, OutboxStatus};
use super::store::OutboxStore;
use super::OutboxSignal;
use crate::broker::{MessageBroker, PublishOptions, PublishReport};
use crate::config::{OutboxConfig, ProcessingMode};
use crate::envelope::{Envelope, EnvelopeType, PayloadRegistry};
use crate::error::{CourierError, Result};
use crate::logging::{log_error, log_outbox_operation};
use crate::serialization::{verify_payload_hash, SerializationError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Another tick held the run guard; nothing was claimed
    pub skipped: bool,
    pub claimed: usize,
    pub processed: usize,
    /// Failed and left pending for another try
    pub failed: usize,
    pub abandoned: usize,
    /// Returned to pending because the tick was cancelled
    pub released: usize,
    /// Items whose settlement could not be written to the store
    pub store_errors: usize,
    /// Items taken over by another worker before this one settled them
    pub lost_claims: usize,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Processed => self.processed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Abandoned => self.abandoned += 1,
            ItemOutcome::Released => self.released += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Processed,
    Failed,
    Abandoned,
    Released,
}

pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    payloads: Arc<PayloadRegistry>,
    config: OutboxConfig,
    worker_id: String,
    run_guard: Mutex<()>,
    signal: OutboxSignal,
}

impl OutboxWorker {
    /// Build a worker; rejects configurations the loop cannot run with
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        payloads: Arc<PayloadRegistry>,
        config: OutboxConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            broker,
            payloads,
            config,
            worker_id: format!("outbox-worker-{}", Uuid::new_v4()),
            run_guard: Mutex::new(()),
            signal: OutboxSignal::new(),
        })
    }

    /// Identity recorded in `claimed_by`
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Share a wake-up signal with writers
    pub fn with_signal(mut self, signal: OutboxSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn signal(&self) -> OutboxSignal {
        self.signal.clone()
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Spawn the background loop
    ///
    /// A disabled worker returns an idle handle without spawning anything.
    pub fn start(self: Arc<Self>) -> OutboxWorkerHandle {
        let trigger = CancellationToken::new();
        let work = CancellationToken::new();

        if !self.config.enabled {
            info!(worker_id = %self.worker_id, "Outbox worker disabled by configuration");
            return OutboxWorkerHandle {
                trigger,
                work,
                task: None,
            };
        }

        let task = tokio::spawn(self.run(trigger.clone(), work.clone()));
        OutboxWorkerHandle {
            trigger,
            work,
            task: Some(task),
        }
    }

    async fn run(self: Arc<Self>, trigger: CancellationToken, work: CancellationToken) {
        info!(
            worker_id = %self.worker_id,
            interval_ms = self.config.processing_interval_ms,
            batch_size = self.config.processing_count,
            mode = ?self.config.processing_mode,
            "🔄 OUTBOX_WORKER: Starting"
        );

        let startup_delay = self.config.startup_delay();
        if !startup_delay.is_zero() {
            tokio::select! {
                _ = trigger.cancelled() => {
                    info!(
                        worker_id = %self.worker_id,
                        "Outbox worker stopped during startup delay"
                    );
                    return;
                }
                _ = tokio::time::sleep(startup_delay) => {}
            }
        }

        if let Err(e) = self.run_startup_purge().await {
            log_error("outbox_worker", "startup_purge", &e.to_string(), None);
        }

        let immediate = self.config.processing_mode == ProcessingMode::Immediate;
        let mut interval = tokio::time::interval(self.config.processing_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = trigger.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.signal.notified(), if immediate => {
                    debug!(worker_id = %self.worker_id, "Woken by outbox signal");
                }
            }

            if let Err(e) = self.tick(&work).await {
                log_error(
                    "outbox_worker",
                    "tick",
                    &e.to_string(),
                    Some(format!("worker_id={}", self.worker_id).as_str()),
                );
            }
        }

        info!(worker_id = %self.worker_id, "✅ OUTBOX_WORKER: Stopped");
    }

    /// Purge rows according to the startup options; returns rows deleted
    ///
    /// `purge_on_startup` removes everything and takes precedence over
    /// `purge_processed_on_startup`. The retention purge runs in either case.
    pub async fn run_startup_purge(&self) -> Result<u64> {
        let mut purged = 0;

        if self.config.purge_on_startup {
            purged += self.store.purge(false).await?;
        } else if self.config.purge_processed_on_startup {
            purged += self.store.purge(true).await?;
        }

        if let Some(retention) = self.config.retention() {
            purged += self.store.purge_processed_older_than(retention).await?;
        }

        if purged > 0 {
            let details = format!("rows={purged}");
            log_outbox_operation("startup_purge", None, None, "purged", Some(details.as_str()));
        }
        Ok(purged)
    }

    /// Claim and forward one batch
    ///
    /// Only a failed claim is returned as an error; per-item store failures
    /// are logged and counted in the report.
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    pub async fn tick(&self, cancellation: &CancellationToken) -> Result<TickReport> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            debug!("Previous tick still running, skipping");
            return Ok(TickReport::skipped());
        };

        let items = self
            .store
            .claim_batch(
                self.config.processing_count,
                &self.worker_id,
                self.config.claim_timeout(),
            )
            .await?;

        let mut report = TickReport {
            claimed: items.len(),
            ..Default::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        for item in &items {
            match self.process_item(item, cancellation).await {
                Ok(outcome) => report.record(outcome),
                Err(e) if e.is_claim_lost() => {
                    report.lost_claims += 1;
                    warn!(
                        item_id = %item.id,
                        envelope_type = %item.envelope_type,
                        "Outbox claim taken over by another worker, settlement dropped"
                    );
                }
                Err(e) => {
                    report.store_errors += 1;
                    log_error(
                        "outbox_worker",
                        "settle_item",
                        &e.to_string(),
                        Some(format!("item_id={}", item.id).as_str()),
                    );
                }
            }
        }

        debug!(
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            abandoned = report.abandoned,
            released = report.released,
            store_errors = report.store_errors,
            lost_claims = report.lost_claims,
            "Outbox tick complete"
        );
        Ok(report)
    }

    async fn process_item(
        &self,
        item: &OutboxItem,
        cancellation: &CancellationToken,
    ) -> Result<ItemOutcome> {
        if cancellation.is_cancelled() {
            return self.release(item).await;
        }

        let delay = self.config.processing_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => return self.release(item).await,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let envelope = match self.decode(item) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .mark_abandoned(item.id, &self.worker_id, &reason)
                    .await?;
                error!(
                    item_id = %item.id,
                    envelope_type = %item.envelope_type,
                    reason = %reason,
                    "🛑 Outbox item abandoned: payload could not be decoded"
                );
                return Ok(ItemOutcome::Abandoned);
            }
        };

        let result = self
            .broker
            .publish_with(&envelope, cancellation, PublishOptions::propagating())
            .await;

        match result {
            Ok(report) => {
                self.store.mark_processed(item.id, &self.worker_id).await?;
                let status = match report {
                    PublishReport::Expired => "expired",
                    PublishReport::NoSubscribers => "no_subscribers",
                    PublishReport::Delivered(_) => "processed",
                };
                log_outbox_operation(
                    "forward",
                    Some(item.id.to_string().as_str()),
                    Some(item.envelope_type.as_str()),
                    status,
                    None,
                );
                Ok(ItemOutcome::Processed)
            }
            Err(e) if cancellation.is_cancelled() || e.is_cancellation() => {
                self.release(item).await
            }
            Err(e) => self.fail(item, &e).await,
        }
    }

    fn decode(&self, item: &OutboxItem) -> std::result::Result<Envelope, SerializationError> {
        verify_payload_hash(&item.payload, &item.payload_hash)?;
        self.payloads
            .verify(&EnvelopeType::new(item.envelope_type.clone()), &item.payload)?;
        item.to_envelope()
    }

    async fn fail(&self, item: &OutboxItem, error: &CourierError) -> Result<ItemOutcome> {
        let reason = error.failure_reason();
        match self
            .store
            .mark_failed(item.id, &self.worker_id, &reason)
            .await?
        {
            OutboxStatus::Abandoned => {
                error!(
                    item_id = %item.id,
                    envelope_type = %item.envelope_type,
                    retry_count = item.retry_count + 1,
                    max_retries = item.max_retries,
                    reason = %reason,
                    "🛑 Outbox item abandoned after exhausting retries"
                );
                Ok(ItemOutcome::Abandoned)
            }
            _ => {
                warn!(
                    item_id = %item.id,
                    envelope_type = %item.envelope_type,
                    retry_count = item.retry_count + 1,
                    max_retries = item.max_retries,
                    reason = %reason,
                    "Outbox item failed, will retry on a later tick"
                );
                Ok(ItemOutcome::Failed)
            }
        }
    }

    async fn release(&self, item: &OutboxItem) -> Result<ItemOutcome> {
        self.store.release_claim(item.id, &self.worker_id).await?;
        debug!(item_id = %item.id, "Released outbox claim on cancellation");
        Ok(ItemOutcome::Released)
    }
}

impl std::fmt::Debug for OutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .field("payloads", &self.payloads)
            .finish()
    }
}

/// Control handle for a started worker
#[derive(Debug)]
pub struct OutboxWorkerHandle {
    trigger: CancellationToken,
    work: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl OutboxWorkerHandle {
    /// Whether a background loop was spawned and has not finished
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop scheduling ticks and wait for the in-flight tick to finish
    ///
    /// Fails with [`CourierError::Internal`] when the loop panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        self.trigger.cancel();
        self.join().await
    }

    /// Stop scheduling ticks and cancel in-flight dispatch; unfinished items
    /// are released back to pending
    pub async fn shutdown_now(mut self) -> Result<()> {
        self.work.cancel();
        self.trigger.cancel();
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await.map_err(|e| {
            log_error("outbox_worker", "shutdown", &e.to_string(), None);
            CourierError::internal(format!("outbox worker task failed: {e}"))
        })
    }
}
