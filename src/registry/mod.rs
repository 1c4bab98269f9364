//! # Registry Infrastructure
//!
//! The two lookups the broker performs on every publish.
//!
//! ## Available Registries
//!
//! - **SubscriptionRegistry**: which handler types listen to an envelope type
//! - **HandlerFactory**: how to obtain a handler instance for a handler type
//!
//! ## Architecture
//!
//! ```text
//! Registry Infrastructure
//! ├── SubscriptionRegistry     (EnvelopeType → [HandlerType], registration order)
//! └── RegistryHandlerFactory   (HandlerType → constructor, resolved per dispatch)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use courier_core::registry::{RegistryHandlerFactory, SubscriptionRegistry};
//!
//! let subscriptions = SubscriptionRegistry::new();
//! assert!(subscriptions.subscribe("OrderPlaced", "SendConfirmation"));
//! assert!(!subscriptions.subscribe("OrderPlaced", "SendConfirmation"));
//!
//! let factory = RegistryHandlerFactory::new();
//! assert!(factory.registered_types().is_empty());
//! ```

pub mod handler_factory;
pub mod subscription_registry;

// Re-export main types for easy access
pub use handler_factory::{HandlerFactory, HandlerFactoryStats, RegistryHandlerFactory};
pub use subscription_registry::{SubscriptionRegistry, SubscriptionStats};
