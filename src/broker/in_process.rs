//! In-process broker: subscriptions in memory, handlers resolved per dispatch.

use super::{
    BrokerStats, BrokerStatsSnapshot, HandlerReport, MessageBroker, PublishOptions, PublishReport,
};
use crate::config::BrokerConfig;
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::{CourierError, Result};
use crate::handler::{HandlerError, HandlerResult, HandlerType};
use crate::logging::log_broker_operation;
use crate::pipeline::{BehaviorContext, Pipeline, Terminal};
use crate::registry::{HandlerFactory, SubscriptionRegistry};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

pub struct InProcessBroker {
    subscriptions: SubscriptionRegistry,
    factory: Arc<dyn HandlerFactory>,
    pipeline: Pipeline,
    stats: BrokerStats,
}

impl InProcessBroker {
    pub fn new(factory: Arc<dyn HandlerFactory>, pipeline: Pipeline) -> Self {
        Self {
            subscriptions: SubscriptionRegistry::new(),
            factory,
            pipeline,
            stats: BrokerStats::default(),
        }
    }

    /// Broker with the standard pipeline built from `config`
    pub fn from_config(factory: Arc<dyn HandlerFactory>, config: &BrokerConfig) -> Self {
        Self::new(factory, Pipeline::from_config(config))
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    async fn run_handler(
        &self,
        envelope: &Envelope,
        handler_type: &HandlerType,
        cancellation: &CancellationToken,
    ) -> HandlerReport {
        let ctx = BehaviorContext::new(
            envelope.envelope_type().as_str(),
            handler_type.as_str(),
            cancellation.clone(),
        );
        let terminal = Dispatch {
            factory: self.factory.as_ref(),
            handler_type,
            envelope,
        };

        // Behaviors can panic too; the terminal only covers the handler itself
        let outcome = match AssertUnwindSafe(self.pipeline.execute(&ctx, &terminal))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        };

        if let Err(err) = &outcome {
            if ctx.failure_count() == 0 {
                ctx.record_failure(ctx.attempt(), err);
            }
            match err {
                HandlerError::Cancelled => debug!(
                    envelope_id = %envelope.id(),
                    handler_type = %handler_type,
                    "Handler invocation cancelled"
                ),
                _ => warn!(
                    envelope_id = %envelope.id(),
                    envelope_type = %envelope.envelope_type(),
                    handler_type = %handler_type,
                    attempts = ctx.failure_count(),
                    error = %err,
                    "Handler settled with failure"
                ),
            }
        }

        HandlerReport {
            handler_type: handler_type.clone(),
            outcome,
            attempts: ctx.attempts(),
            elapsed: ctx.elapsed(),
        }
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    fn subscribe(&self, envelope_type: EnvelopeType, handler_type: HandlerType) -> bool {
        self.subscriptions.subscribe(envelope_type, handler_type)
    }

    fn unsubscribe(&self, envelope_type: &EnvelopeType, handler_type: &HandlerType) -> bool {
        self.subscriptions.unsubscribe(envelope_type, handler_type)
    }

    #[instrument(
        skip_all,
        fields(envelope_id = %envelope.id(), envelope_type = %envelope.envelope_type())
    )]
    async fn publish_with(
        &self,
        envelope: &Envelope,
        cancellation: &CancellationToken,
        options: PublishOptions,
    ) -> Result<PublishReport> {
        if cancellation.is_cancelled() {
            debug!("Publish cancelled before dispatch");
            return Err(CourierError::cancelled("publish"));
        }
        self.stats.record_published();

        if envelope.is_expired(Utc::now()) {
            self.stats.record_expired();
            warn!(
                envelope_id = %envelope.id(),
                envelope_type = %envelope.envelope_type(),
                created_at = %envelope.created_at(),
                ttl_ms = envelope.ttl().map(|ttl| ttl.as_millis() as u64),
                "⌛ Dropping expired envelope"
            );
            return Ok(PublishReport::Expired);
        }

        let handlers = self.subscriptions.handlers_for(envelope.envelope_type());
        if handlers.is_empty() {
            log_broker_operation(
                "publish",
                envelope.envelope_type().as_str(),
                0,
                "no_subscribers",
                None,
            );
            return Ok(PublishReport::NoSubscribers);
        }

        // Futures are created (and first polled) in subscription order
        let runs = handlers
            .iter()
            .map(|handler_type| self.run_handler(envelope, handler_type, cancellation));
        let reports = join_all(runs).await;

        let failed = reports.iter().filter(|r| !r.succeeded()).count();
        let delivered = reports.len() - failed;
        self.stats.record_delivered(delivered as u64);
        self.stats.record_failed(failed as u64);

        let status = if failed == 0 { "delivered" } else { "partial_failure" };
        let details = format!("delivered={delivered} failed={failed}");
        log_broker_operation(
            "publish",
            envelope.envelope_type().as_str(),
            reports.len(),
            status,
            Some(details.as_str()),
        );

        let report = PublishReport::Delivered(reports);
        if options.propagate_failures && failed > 0 {
            return Err(CourierError::HandlerFailures {
                envelope_type: envelope.envelope_type().to_string(),
                failures: report.failures(),
            });
        }

        Ok(report)
    }
}

impl std::fmt::Debug for InProcessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroker")
            .field("subscriptions", &self.subscriptions.stats())
            .field("pipeline", &self.pipeline)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// End of the chain: resolve the handler and call it
struct Dispatch<'a> {
    factory: &'a dyn HandlerFactory,
    handler_type: &'a HandlerType,
    envelope: &'a Envelope,
}

#[async_trait]
impl<'a> Terminal for Dispatch<'a> {
    async fn call(&self, ctx: &BehaviorContext) -> HandlerResult {
        let handler = self.factory.resolve(self.handler_type).ok_or_else(|| {
            error!(handler_type = %self.handler_type, "Handler type could not be resolved");
            HandlerError::Unresolved {
                handler_type: self.handler_type.to_string(),
            }
        })?;

        match AssertUnwindSafe(handler.handle(self.envelope, ctx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    handler_type = %self.handler_type,
                    attempt = ctx.attempt(),
                    panic = %message,
                    "🔥 Handler panicked"
                );
                Err(HandlerError::Panicked { message })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
