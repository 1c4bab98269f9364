//! # Behavior Pipeline
//!
//! Composable interceptors wrapping every handler invocation.
//!
//! ## Architecture
//!
//! ```text
//! publish ─▶ Retry ─▶ Timeout ─▶ Chaos ─▶ resolve + handle
//!            (first registered is outermost)
//! ```
//!
//! A [`Behavior`] receives the [`BehaviorContext`] and a [`Next`] handle to the
//! remainder of the chain. Calling [`Next::run`] invokes the following behavior
//! (or the terminal handler call); a behavior may call it several times (retry)
//! or race it (timeout) but cannot reorder or skip what comes after it.

mod chaos;
mod context;
mod retry;
mod timeout;

pub use chaos::ChaosBehavior;
pub use context::{AttemptRecord, BehaviorContext};
pub use retry::{BackoffPolicy, RetryBehavior};
pub use timeout::TimeoutBehavior;

use crate::config::BrokerConfig;
use crate::handler::HandlerResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// An interceptor around the rest of the call chain
#[async_trait]
pub trait Behavior: Send + Sync {
    async fn invoke(&self, ctx: &BehaviorContext, next: Next<'_>) -> HandlerResult;

    fn name(&self) -> &'static str;
}

/// The innermost call the chain ends in
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn call(&self, ctx: &BehaviorContext) -> HandlerResult;
}

/// Handle to the remainder of the chain
#[derive(Clone, Copy)]
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn Behavior>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &BehaviorContext) -> HandlerResult {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    terminal: self.terminal,
                };
                behavior.invoke(ctx, next).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

/// Ordered list of behaviors
#[derive(Clone, Default)]
pub struct Pipeline {
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard chain from configuration: retry, then timeout, then chaos
    pub fn from_config(config: &BrokerConfig) -> Self {
        let backoff = match &config.exponential_backoff {
            Some(exp) => BackoffPolicy::Exponential {
                initial: Duration::from_millis(exp.initial_ms),
                multiplier: exp.multiplier,
                max: Duration::from_millis(exp.max_ms),
                jitter: exp.jitter,
            },
            None => BackoffPolicy::Fixed(config.retry_backoff()),
        };

        let mut pipeline =
            Self::new().with(RetryBehavior::new(config.retry_attempts, backoff));

        if let Some(timeout) = config.handler_timeout() {
            pipeline.push(TimeoutBehavior::new(timeout));
        }

        if let Some(rate) = config.chaos_injection_rate {
            pipeline.push(ChaosBehavior::new(rate));
        }

        pipeline
    }

    /// Append a behavior; it wraps everything registered after it
    pub fn push<B: Behavior + 'static>(&mut self, behavior: B) -> &mut Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    pub fn with<B: Behavior + 'static>(mut self, behavior: B) -> Self {
        self.push(behavior);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    /// Run the whole chain ending in `terminal`
    pub async fn execute(&self, ctx: &BehaviorContext, terminal: &dyn Terminal) -> HandlerResult {
        Next {
            behaviors: &self.behaviors,
            terminal,
        }
        .run(ctx)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("behaviors", &self.names())
            .finish()
    }
}
