//! Synthetic fault injection for resilience testing.

use super::{Behavior, BehaviorContext, Next};
use crate::handler::{HandlerError, HandlerResult};
use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

/// Fails a random fraction of calls before they reach the handler
///
/// Configuration validation keeps this out of production environments.
#[derive(Debug, Clone)]
pub struct ChaosBehavior {
    injection_rate: f64,
}

impl ChaosBehavior {
    /// Rate is clamped to `0.0..=1.0`
    pub fn new(injection_rate: f64) -> Self {
        let injection_rate = if injection_rate.is_nan() {
            0.0
        } else {
            injection_rate.clamp(0.0, 1.0)
        };
        Self { injection_rate }
    }

    pub fn injection_rate(&self) -> f64 {
        self.injection_rate
    }
}

#[async_trait]
impl Behavior for ChaosBehavior {
    async fn invoke(&self, ctx: &BehaviorContext, next: Next<'_>) -> HandlerResult {
        let inject = rand::thread_rng().gen_bool(self.injection_rate);

        if inject {
            debug!(
                handler_type = %ctx.handler_type(),
                attempt = ctx.attempt(),
                rate = self.injection_rate,
                "💥 Injecting synthetic handler failure"
            );
            return Err(HandlerError::Injected {
                rate: self.injection_rate,
            });
        }

        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "chaos"
    }
}
