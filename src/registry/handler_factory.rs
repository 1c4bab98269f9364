//! # Handler Factory
//!
//! Resolves handler instances from their [`HandlerType`] key at dispatch time.
//!
//! ## Overview
//!
//! The broker never stores handler instances. Each delivery asks the factory
//! for a handler, which lets an application choose per registration whether a
//! handler is constructed fresh for every dispatch ([`RegistryHandlerFactory::register`])
//! or shared ([`RegistryHandlerFactory::register_shared`]).
//!
//! Any other container can be plugged in by implementing [`HandlerFactory`].

use crate::envelope::Message;
use crate::handler::{EnvelopeHandler, HandlerType, MessageHandler, TypedHandler};
use crate::serialization::Serializer;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Source of handler instances
pub trait HandlerFactory: Send + Sync {
    /// `None` when nothing is registered under `handler_type`
    fn resolve(&self, handler_type: &HandlerType) -> Option<Arc<dyn EnvelopeHandler>>;
}

type HandlerConstructor = Arc<dyn Fn() -> Arc<dyn EnvelopeHandler> + Send + Sync>;

/// Thread-safe factory backed by registered constructors
#[derive(Default)]
pub struct RegistryHandlerFactory {
    constructors: DashMap<HandlerType, HandlerConstructor>,
    resolutions: AtomicU64,
    misses: AtomicU64,
}

impl RegistryHandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor invoked on every dispatch
    pub fn register<H, F>(&self, handler_type: impl Into<HandlerType>, constructor: F)
    where
        H: EnvelopeHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let handler_type = handler_type.into();
        let constructor: HandlerConstructor =
            Arc::new(move || Arc::new(constructor()) as Arc<dyn EnvelopeHandler>);
        self.insert(handler_type, constructor);
    }

    /// Register one instance reused for every dispatch
    pub fn register_shared(
        &self,
        handler_type: impl Into<HandlerType>,
        handler: Arc<dyn EnvelopeHandler>,
    ) {
        let constructor: HandlerConstructor = Arc::new(move || handler.clone());
        self.insert(handler_type.into(), constructor);
    }

    /// Register a typed message handler, decoded with `serializer` before each call
    pub fn register_typed<M, H, S, F>(
        &self,
        handler_type: impl Into<HandlerType>,
        serializer: S,
        constructor: F,
    ) where
        M: Message,
        H: MessageHandler<M> + 'static,
        S: Serializer,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.register(handler_type, move || {
            TypedHandler::<M, H, S>::new(constructor(), serializer.clone())
        });
    }

    /// Remove a registration; returns whether one existed
    pub fn deregister(&self, handler_type: &HandlerType) -> bool {
        let removed = self.constructors.remove(handler_type).is_some();
        if removed {
            info!(handler_type = %handler_type, "Deregistered handler");
        }
        removed
    }

    pub fn contains(&self, handler_type: &HandlerType) -> bool {
        self.constructors.contains_key(handler_type)
    }

    pub fn registered_types(&self) -> Vec<HandlerType> {
        let mut types: Vec<HandlerType> = self
            .constructors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    pub fn stats(&self) -> HandlerFactoryStats {
        HandlerFactoryStats {
            registered_handlers: self.constructors.len(),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, handler_type: HandlerType, constructor: HandlerConstructor) {
        let replaced = self
            .constructors
            .insert(handler_type.clone(), constructor)
            .is_some();
        info!(
            handler_type = %handler_type,
            replaced = replaced,
            "Registered handler"
        );
    }
}

impl HandlerFactory for RegistryHandlerFactory {
    fn resolve(&self, handler_type: &HandlerType) -> Option<Arc<dyn EnvelopeHandler>> {
        // Clone out of the map so the shard lock is released before constructing
        let constructor = self
            .constructors
            .get(handler_type)
            .map(|entry| entry.value().clone());

        match constructor {
            Some(constructor) => {
                self.resolutions.fetch_add(1, Ordering::Relaxed);
                Some(constructor())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(handler_type = %handler_type, "No handler registered");
                None
            }
        }
    }
}

impl std::fmt::Debug for RegistryHandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandlerFactory")
            .field("registered_types", &self.registered_types())
            .finish()
    }
}

/// Statistics about handler resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFactoryStats {
    pub registered_handlers: usize,
    pub resolutions: u64,
    pub misses: u64,
}
