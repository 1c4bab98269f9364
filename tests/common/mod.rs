//! Shared fixtures for the broker and outbox integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use async_trait::async_trait;
use courier_core::broker::{InProcessBroker, MessageBroker, PublishOptions, PublishReport};
use courier_core::config::{BrokerConfig, OutboxConfig};
use courier_core::envelope::{Envelope, EnvelopeType, Message, PayloadRegistry};
use courier_core::error::{CourierError, HandlerFailure, Result};
use courier_core::handler::{
    EnvelopeHandler, HandlerError, HandlerResult, HandlerType, MessageHandler,
};
use courier_core::pipeline::BehaviorContext;
use courier_core::registry::RegistryHandlerFactory;
use courier_core::serialization::JsonSerializer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
    pub customer: String,
}

impl Message for OrderPlaced {
    const TYPE: &'static str = "OrderPlaced";
}

impl OrderPlaced {
    pub fn new(order_id: u64) -> Self {
        Self {
            order_id,
            customer: format!("customer-{order_id}"),
        }
    }
}

pub fn order_envelope(order_id: u64) -> Envelope {
    Envelope::from_message(&OrderPlaced::new(order_id), &JsonSerializer)
        .expect("OrderPlaced serializes")
}

pub fn payloads() -> Arc<PayloadRegistry> {
    Arc::new(PayloadRegistry::new().with::<OrderPlaced, _>(JsonSerializer))
}

/// Pipeline settings without backoff sleeps
pub fn broker_config(retry_attempts: u32) -> BrokerConfig {
    BrokerConfig {
        retry_attempts,
        retry_backoff_ms: 0,
        ..Default::default()
    }
}

/// Outbox settings suited to driving ticks by hand
pub fn outbox_config() -> OutboxConfig {
    OutboxConfig {
        startup_delay_ms: 0,
        processing_interval_ms: 60_000,
        processing_count: 100,
        max_retries: 3,
        ..Default::default()
    }
}

pub fn no_cancel() -> CancellationToken {
    CancellationToken::new()
}

/// Ordered record of handler invocations, shared between handler instances
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Succeeds and records its name
pub struct Recording {
    pub name: &'static str,
    pub log: CallLog,
}

#[async_trait]
impl EnvelopeHandler for Recording {
    async fn handle(&self, _envelope: &Envelope, _ctx: &BehaviorContext) -> HandlerResult {
        self.log.record(self.name);
        Ok(())
    }
}

/// Always fails and records its name
pub struct Failing {
    pub name: &'static str,
    pub log: CallLog,
}

#[async_trait]
impl EnvelopeHandler for Failing {
    async fn handle(&self, _envelope: &Envelope, _ctx: &BehaviorContext) -> HandlerResult {
        self.log.record(self.name);
        Err(HandlerError::failed(format!("{} is down", self.name)))
    }
}

pub struct Panicking;

#[async_trait]
impl EnvelopeHandler for Panicking {
    async fn handle(&self, _envelope: &Envelope, _ctx: &BehaviorContext) -> HandlerResult {
        panic!("inventory service exploded");
    }
}

/// Sleeps for `delay`; spawned watcher reports whether the invocation's
/// cancellation token fired
pub struct Sleeping {
    pub delay: Duration,
    pub started: Arc<Notify>,
    pub observed_cancel: Arc<AtomicBool>,
}

impl Sleeping {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(Notify::new()),
            observed_cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl EnvelopeHandler for Sleeping {
    async fn handle(&self, _envelope: &Envelope, ctx: &BehaviorContext) -> HandlerResult {
        let token = ctx.cancellation().clone();
        let observed = self.observed_cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            observed.store(true, Ordering::SeqCst);
        });

        self.started.notify_one();
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }
}

/// Typed handler collecting decoded orders
#[derive(Clone, Default)]
pub struct OrderCollector {
    pub orders: Arc<Mutex<Vec<OrderPlaced>>>,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for OrderCollector {
    async fn handle(
        &self,
        message: OrderPlaced,
        _envelope: &Envelope,
        _ctx: &BehaviorContext,
    ) -> HandlerResult {
        self.orders.lock().push(message);
        Ok(())
    }
}

impl OrderCollector {
    pub fn order_ids(&self) -> Vec<u64> {
        self.orders.lock().iter().map(|o| o.order_id).collect()
    }
}

/// Broker wired to `factory` with the standard pipeline from `config`
pub fn broker(factory: RegistryHandlerFactory, config: &BrokerConfig) -> Arc<InProcessBroker> {
    Arc::new(InProcessBroker::from_config(Arc::new(factory), config))
}

/// Broker double that fails its first `failures` publishes
pub struct FlakyBroker {
    failures: AtomicU32,
    pub publishes: AtomicUsize,
}

impl FlakyBroker {
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            publishes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    fn subscribe(&self, _envelope_type: EnvelopeType, _handler_type: HandlerType) -> bool {
        true
    }

    fn unsubscribe(&self, _envelope_type: &EnvelopeType, _handler_type: &HandlerType) -> bool {
        true
    }

    async fn publish_with(
        &self,
        envelope: &Envelope,
        _cancellation: &CancellationToken,
        _options: PublishOptions,
    ) -> Result<PublishReport> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CourierError::HandlerFailures {
                envelope_type: envelope.envelope_type().to_string(),
                failures: vec![HandlerFailure::new(
                    "Downstream",
                    HandlerError::failed("transient outage"),
                )],
            });
        }
        Ok(PublishReport::Delivered(Vec::new()))
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
