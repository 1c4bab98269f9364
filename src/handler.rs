//! # Handler Contract
//!
//! A handler receives an [`Envelope`] and settles it with success or a
//! [`HandlerError`]. Handlers are looked up per dispatch through a
//! [`HandlerFactory`](crate::registry::HandlerFactory) using their
//! [`HandlerType`] key; the broker never holds handler instances itself.

use crate::envelope::{Envelope, Message};
use crate::pipeline::BehaviorContext;
use crate::serialization::{SerializationError, Serializer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;

/// Why a handler invocation did not succeed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("Handler failed: {reason}")]
    Failed { reason: String },

    #[error("Handler timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("Handler cancelled")]
    Cancelled,

    #[error("Injected fault (rate {rate})")]
    Injected { rate: f64 },

    #[error("Handler panicked: {message}")]
    Panicked { message: String },

    #[error("No handler could be resolved for '{handler_type}'")]
    Unresolved { handler_type: String },

    #[error("Payload could not be decoded: {0}")]
    Decode(#[from] SerializationError),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. }
            | Self::TimedOut { .. }
            | Self::Injected { .. }
            | Self::Panicked { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Registration key of a handler implementation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerType(String);

impl HandlerType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for HandlerType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Handles raw envelopes
///
/// Implementations must be idempotent: delivery is at-least-once. Long-running
/// work should watch `ctx.cancellation()` at its suspension points.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, ctx: &BehaviorContext) -> HandlerResult;
}

/// Handles one decoded message type
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync {
    async fn handle(&self, message: M, envelope: &Envelope, ctx: &BehaviorContext)
        -> HandlerResult;
}

/// Adapts a [`MessageHandler`] into an [`EnvelopeHandler`] by decoding first
pub struct TypedHandler<M, H, S> {
    inner: H,
    serializer: S,
    _message: PhantomData<fn() -> M>,
}

impl<M, H, S> TypedHandler<M, H, S>
where
    M: Message,
    H: MessageHandler<M>,
    S: Serializer,
{
    pub fn new(inner: H, serializer: S) -> Self {
        Self {
            inner,
            serializer,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, H, S> EnvelopeHandler for TypedHandler<M, H, S>
where
    M: Message,
    H: MessageHandler<M>,
    S: Serializer,
{
    async fn handle(&self, envelope: &Envelope, ctx: &BehaviorContext) -> HandlerResult {
        let message: M = envelope.decode(&self.serializer)?;
        self.inner.handle(message, envelope, ctx).await
    }
}
