//! Per-invocation context handed through the behavior chain.

use crate::handler::HandlerError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One failed try, as seen by the retry behavior
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// Context for a single handler invocation
///
/// A fresh context is created for every handler a publish fans out to.
/// Behaviors derive narrowed copies (`for_attempt`, `with_cancellation`) that
/// share the start time and the attempt log of the invocation they belong to.
#[derive(Debug, Clone)]
pub struct BehaviorContext {
    envelope_type: String,
    handler_type: String,
    attempt: u32,
    started_at: Instant,
    cancellation: CancellationToken,
    attempt_log: Arc<Mutex<Vec<AttemptRecord>>>,
}

impl BehaviorContext {
    pub fn new(
        envelope_type: impl Into<String>,
        handler_type: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            envelope_type: envelope_type.into(),
            handler_type: handler_type.into(),
            attempt: 1,
            started_at: Instant::now(),
            cancellation,
            attempt_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Context with its own, never-cancelled token
    pub fn detached(envelope_type: impl Into<String>, handler_type: impl Into<String>) -> Self {
        Self::new(envelope_type, handler_type, CancellationToken::new())
    }

    /// Same invocation, numbered attempt
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Same invocation, narrower cancellation scope
    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    pub fn envelope_type(&self) -> &str {
        &self.envelope_type
    }

    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    /// 1-based try number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn record_failure(&self, attempt: u32, error: &HandlerError) {
        self.attempt_log.lock().push(AttemptRecord {
            attempt,
            error: error.to_string(),
            timed_out: error.is_timeout(),
            elapsed_ms: self.elapsed().as_millis() as u64,
        });
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempt_log.lock().clone()
    }

    pub fn failure_count(&self) -> usize {
        self.attempt_log.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_contexts_share_attempt_log() {
        let ctx = BehaviorContext::detached("OrderPlaced", "SendConfirmation");
        let second = ctx.for_attempt(2);
        second.record_failure(2, &HandlerError::failed("smtp down"));

        assert_eq!(ctx.attempt(), 1);
        assert_eq!(second.attempt(), 2);
        assert_eq!(ctx.failure_count(), 1);
        assert_eq!(ctx.attempts()[0].error, "Handler failed: smtp down");
    }

    #[test]
    fn test_child_cancellation_does_not_reach_parent() {
        let ctx = BehaviorContext::detached("A", "H");
        let child = ctx.with_cancellation(ctx.cancellation().child_token());

        child.cancellation().cancel();
        assert!(child.is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_reaches_child() {
        let ctx = BehaviorContext::detached("A", "H");
        let child = ctx.with_cancellation(ctx.cancellation().child_token());

        ctx.cancellation().cancel();
        assert!(child.is_cancelled());
    }
}
