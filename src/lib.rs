#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Courier Core
//!
//! Reliable message delivery: an in-process publish/subscribe broker with a
//! composable behavior pipeline, layered on a transactional outbox that gives
//! at-least-once delivery across process crashes.
//!
//! ## Architecture
//!
//! ```text
//! OutboxWriter ─▶ OutboxStore ◀─ OutboxWorker ─▶ MessageBroker ─▶ Pipeline ─▶ handlers
//!                 (memory/pg)     (claim, tick)   (fan-out)       (retry, timeout, chaos)
//! ```
//!
//! ## Module Organization
//!
//! - [`envelope`] - Unit of delivery and the payload registry
//! - [`handler`] - Handler contract and typed adapters
//! - [`registry`] - Subscriptions and handler resolution
//! - [`pipeline`] - Retry, timeout and fault-injection behaviors
//! - [`broker`] - Publish/subscribe engine
//! - [`outbox`] - Outbox rows, stores, writer and background worker
//! - [`transport`] - Wire binding for external transports
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Delivery Guarantees
//!
//! Delivery is **at-least-once**: a crash between publishing and recording the
//! result re-dispatches the item after its claim times out. Handlers must be
//! idempotent; forwarded envelopes carry the outbox row id under the
//! `courier.outbox_item_id` property for deduplication.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_core::broker::{InProcessBroker, MessageBroker};
//! use courier_core::config::ConfigManager;
//! use courier_core::envelope::{Message, PayloadRegistry};
//! use courier_core::outbox::{InMemoryOutboxStore, OutboxWorker, OutboxWriter};
//! use courier_core::registry::RegistryHandlerFactory;
//! use courier_core::serialization::JsonSerializer;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! impl Message for OrderPlaced {
//!     const TYPE: &'static str = "OrderPlaced";
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! courier_core::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//!
//! let factory = Arc::new(RegistryHandlerFactory::new());
//! let broker = Arc::new(InProcessBroker::from_config(factory, &config.broker));
//! broker.subscribe("OrderPlaced".into(), "SendConfirmation".into());
//!
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let payloads = Arc::new(PayloadRegistry::new().with::<OrderPlaced, _>(JsonSerializer));
//! let worker = Arc::new(OutboxWorker::new(
//!     store.clone(),
//!     broker,
//!     payloads,
//!     config.outbox.clone(),
//! )?);
//! let writer = OutboxWriter::new(store, JsonSerializer, &config.outbox, worker.signal());
//!
//! let handle = worker.start();
//! writer.write(&OrderPlaced { order_id: 1 }).await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod logging;
pub mod outbox;
pub mod pipeline;
pub mod registry;
pub mod serialization;
pub mod transport;

pub use broker::{InProcessBroker, MessageBroker, PublishOptions, PublishReport};
pub use config::{BrokerConfig, ConfigManager, CourierConfig, OutboxConfig, ProcessingMode};
pub use envelope::{Envelope, EnvelopeId, EnvelopeType, Message, PayloadRegistry};
pub use error::{CourierError, Result};
pub use handler::{EnvelopeHandler, HandlerError, HandlerResult, HandlerType, MessageHandler};
pub use outbox::{
    InMemoryOutboxStore, OutboxItem, OutboxSignal, OutboxStatus, OutboxStore, OutboxWorker,
    OutboxWriter,
};
pub use pipeline::{Behavior, BehaviorContext, Pipeline};
pub use serialization::{JsonSerializer, Serializer};
