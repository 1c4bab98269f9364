//! Bounds the wall-clock time of everything nested inside it.

use super::{Behavior, BehaviorContext, Next};
use crate::handler::{HandlerError, HandlerResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Races the rest of the chain against a deadline
///
/// The nested call sees a child cancellation token. When the deadline wins the
/// child token is cancelled, so the abandoned call observes cancellation at its
/// next suspension point; the caller's own token is left untouched.
#[derive(Debug, Clone)]
pub struct TimeoutBehavior {
    timeout: Duration,
}

impl TimeoutBehavior {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Behavior for TimeoutBehavior {
    async fn invoke(&self, ctx: &BehaviorContext, next: Next<'_>) -> HandlerResult {
        let scoped = ctx.cancellation().child_token();
        let scoped_ctx = ctx.with_cancellation(scoped.clone());

        tokio::select! {
            result = next.run(&scoped_ctx) => result,
            _ = tokio::time::sleep(self.timeout) => {
                scoped.cancel();
                warn!(
                    envelope_type = %ctx.envelope_type(),
                    handler_type = %ctx.handler_type(),
                    attempt = ctx.attempt(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "⏱️ Handler timed out"
                );
                Err(HandlerError::TimedOut { after: self.timeout })
            }
        }
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, Terminal};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Sleeps for `delay` unless cancelled first; remembers the token it saw
    struct Sleeper {
        delay: Duration,
        seen: Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl Terminal for Sleeper {
        async fn call(&self, ctx: &BehaviorContext) -> HandlerResult {
            *self.seen.lock() = Some(ctx.cancellation().clone());
            tokio::select! {
                _ = ctx.cancellation().cancelled() => Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            }
        }
    }

    fn sleeper(delay: Duration) -> Arc<Sleeper> {
        Arc::new(Sleeper {
            delay,
            seen: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let pipeline = Pipeline::new().with(TimeoutBehavior::new(Duration::from_secs(5)));
        let terminal = sleeper(Duration::from_millis(5));
        let ctx = BehaviorContext::detached("A", "H");

        assert!(pipeline.execute(&ctx, terminal.as_ref()).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_is_cancelled() {
        let pipeline = Pipeline::new().with(TimeoutBehavior::new(Duration::from_millis(50)));
        let terminal = sleeper(Duration::from_secs(30));
        let ctx = BehaviorContext::detached("A", "H");

        let started = std::time::Instant::now();
        let result = pipeline.execute(&ctx, terminal.as_ref()).await;

        assert_eq!(
            result,
            Err(HandlerError::TimedOut {
                after: Duration::from_millis(50)
            })
        );
        assert!(started.elapsed() < Duration::from_secs(5));

        let seen = terminal.seen.lock().clone().unwrap();
        assert!(seen.is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_caller_cancellation_is_not_a_timeout() {
        let pipeline = Pipeline::new().with(TimeoutBehavior::new(Duration::from_secs(30)));
        let terminal = sleeper(Duration::from_secs(30));
        let ctx = BehaviorContext::detached("A", "H");

        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = pipeline.execute(&ctx, terminal.as_ref()).await;
        assert_eq!(result, Err(HandlerError::Cancelled));
    }
}
