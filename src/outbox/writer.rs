//! # Outbox Writer
//!
//! The business side of the outbox: turns messages into [`OutboxItem`]s and
//! hands them to the store.
//!
//! With `auto_save` on, each write is inserted immediately. With it off, writes
//! are staged and [`OutboxWriter::save`] inserts them together, mirroring a unit
//! of work that commits its outbox rows alongside the domain change.

use super::item::OutboxItem;
use super::store::OutboxStore;
use super::OutboxSignal;
use crate::config::{OutboxConfig, ProcessingMode};
use crate::envelope::{Envelope, Message};
use crate::error::Result;
use crate::logging::log_outbox_operation;
use crate::serialization::{JsonSerializer, Serializer};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct OutboxWriter<S: Serializer = JsonSerializer> {
    store: Arc<dyn OutboxStore>,
    serializer: S,
    auto_save: bool,
    max_retries: u32,
    mode: ProcessingMode,
    signal: OutboxSignal,
    staged: Mutex<Vec<OutboxItem>>,
}

impl<S: Serializer> OutboxWriter<S> {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        serializer: S,
        config: &OutboxConfig,
        signal: OutboxSignal,
    ) -> Self {
        Self {
            store,
            serializer,
            auto_save: config.auto_save,
            max_retries: config.max_retries,
            mode: config.processing_mode,
            signal,
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Serialize and write a message; returns the outbox item id
    pub async fn write<M: Message>(&self, message: &M) -> Result<Uuid> {
        let envelope = Envelope::from_message(message, &self.serializer)?;
        self.write_envelope(&envelope).await
    }

    /// Write an already built envelope; returns the outbox item id
    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<Uuid> {
        let item = OutboxItem::from_envelope(envelope, self.max_retries);
        let id = item.id;

        if self.auto_save {
            self.store.insert(item).await?;
            log_outbox_operation(
                "write",
                Some(id.to_string().as_str()),
                Some(envelope.envelope_type().as_str()),
                "inserted",
                None,
            );
            self.notify_worker();
        } else {
            self.staged.lock().push(item);
            debug!(item_id = %id, envelope_type = %envelope.envelope_type(), "Staged outbox item");
        }

        Ok(id)
    }

    /// Insert every staged item in one batch; returns how many were saved
    ///
    /// On failure the staged items are kept so the caller can retry or discard.
    pub async fn save(&self) -> Result<usize> {
        let batch = std::mem::take(&mut *self.staged.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        if let Err(error) = self.store.insert_many(batch.clone()).await {
            let mut staged = self.staged.lock();
            let newer = std::mem::replace(&mut *staged, batch);
            staged.extend(newer);
            return Err(error);
        }

        let details = format!("count={count}");
        log_outbox_operation("save", None, None, "inserted", Some(details.as_str()));
        self.notify_worker();
        Ok(count)
    }

    /// Drop staged items without saving them
    pub fn discard(&self) -> usize {
        let mut staged = self.staged.lock();
        let count = staged.len();
        staged.clear();
        count
    }

    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    fn notify_worker(&self) {
        if self.mode == ProcessingMode::Immediate {
            self.signal.notify();
        }
    }
}
