//! # Retry Behavior
//!
//! Re-runs the rest of the chain until it succeeds, the attempt budget is
//! spent, or the invocation is cancelled. Every failed try is appended to the
//! context's attempt log.

use super::{Behavior, BehaviorContext, Next};
use crate::constants::defaults::{JITTER_MAX, JITTER_MIN};
use crate::handler::{HandlerError, HandlerResult};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between tries
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `initial * multiplier^n`, capped at `max`, optionally jittered by ±15%
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: bool,
    },
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self::Fixed(Duration::ZERO)
    }

    /// Delay before retry `retry` (0 for the first retry)
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = if scaled.is_finite() {
                    scaled.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if *jitter {
                    delay.mul_f64(rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX))
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryBehavior {
    attempts: u32,
    backoff: BackoffPolicy,
}

impl RetryBehavior {
    /// `attempts` counts the first try; values below 1 are raised to 1
    pub fn new(attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

#[async_trait]
impl Behavior for RetryBehavior {
    async fn invoke(&self, ctx: &BehaviorContext, next: Next<'_>) -> HandlerResult {
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let error = match next.run(&ctx.for_attempt(attempt)).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(
                            handler_type = %ctx.handler_type(),
                            attempt = attempt,
                            "Handler succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(error) => error,
            };

            ctx.record_failure(attempt, &error);

            if !error.is_retryable() || attempt >= self.attempts {
                return Err(error);
            }

            let delay = self.backoff.delay(attempt - 1);
            warn!(
                envelope_type = %ctx.envelope_type(),
                handler_type = %ctx.handler_type(),
                attempt = attempt,
                max_attempts = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "🔁 Handler attempt failed, retrying"
            );

            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}
