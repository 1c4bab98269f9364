//! # Subscription Registry
//!
//! Maps envelope types to the handler types subscribed to them.
//!
//! ## Key Features
//!
//! - **Idempotent subscribe**: a pair is stored at most once
//! - **Registration order**: `handlers_for` lists handlers in the order they subscribed
//! - **Snapshot reads**: callers get an owned copy, so dispatch never holds the lock
//!
//! Matching is by exact envelope type name.

use crate::envelope::EnvelopeType;
use crate::handler::HandlerType;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<EnvelopeType, Vec<HandlerType>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler type; returns `false` if the pair already existed
    pub fn subscribe(
        &self,
        envelope_type: impl Into<EnvelopeType>,
        handler_type: impl Into<HandlerType>,
    ) -> bool {
        let envelope_type = envelope_type.into();
        let handler_type = handler_type.into();

        let mut subscriptions = self.subscriptions.write();
        let handlers = subscriptions.entry(envelope_type.clone()).or_default();
        if handlers.contains(&handler_type) {
            debug!(
                envelope_type = %envelope_type,
                handler_type = %handler_type,
                "Subscription already present"
            );
            return false;
        }

        handlers.push(handler_type.clone());
        info!(
            envelope_type = %envelope_type,
            handler_type = %handler_type,
            "Subscribed handler"
        );
        true
    }

    /// Remove a subscription; returns `false` if it did not exist
    pub fn unsubscribe(&self, envelope_type: &EnvelopeType, handler_type: &HandlerType) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(handlers) = subscriptions.get_mut(envelope_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|h| h != handler_type);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            subscriptions.remove(envelope_type);
        }

        if removed {
            info!(
                envelope_type = %envelope_type,
                handler_type = %handler_type,
                "Unsubscribed handler"
            );
        }
        removed
    }

    /// Handler types for an envelope type, in registration order
    pub fn handlers_for(&self, envelope_type: &EnvelopeType) -> Vec<HandlerType> {
        self.subscriptions
            .read()
            .get(envelope_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, envelope_type: &EnvelopeType, handler_type: &HandlerType) -> bool {
        self.subscriptions
            .read()
            .get(envelope_type)
            .is_some_and(|handlers| handlers.contains(handler_type))
    }

    /// All subscriptions, sorted by envelope type
    pub fn subscriptions(&self) -> Vec<(EnvelopeType, Vec<HandlerType>)> {
        let mut all: Vec<_> = self
            .subscriptions
            .read()
            .iter()
            .map(|(envelope_type, handlers)| (envelope_type.clone(), handlers.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn stats(&self) -> SubscriptionStats {
        let subscriptions = self.subscriptions.read();
        SubscriptionStats {
            envelope_types: subscriptions.len(),
            total_subscriptions: subscriptions.values().map(Vec::len).sum(),
        }
    }
}

/// Statistics about registered subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub envelope_types: usize,
    pub total_subscriptions: usize,
}
