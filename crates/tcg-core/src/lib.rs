//! # tcg-core
//!
//! Transport subsystem for forwarding observability data to a downstream
//! Groundwork API: a durable pub/sub broker, a dispatcher that owns worker
//! subscriptions and retry, an HTTP client to the gateway, a small keyed
//! cache, and the agent service tying them together.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tcg_core::prelude::*;
//! use tcg_core::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     config.validate().expect("invalid configuration");
//! }
//! ```

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

/// Agent service: owns the broker, dispatcher and Groundwork client
/// lifecycle.
pub mod agent;

/// Durable pub/sub broker.
pub mod broker;

/// Keyed cache with TTL, used for auth tokens, dedup keys and retry state.
pub mod cache;

/// In-memory configuration surface and checksum-based reload.
pub mod config;

/// Dispatcher: worker registry, subscription lifecycle, retry.
pub mod dispatcher;

/// Error taxonomy, split into retriable and terminal variants.
pub mod error;

/// HTTP client to the downstream Groundwork API.
#[cfg(feature = "http-client")]
pub mod groundwork;

/// Graceful shutdown primitives shared across the service lifecycle.
pub mod shutdown;

/// `tracing` initialization.
pub mod telemetry;

// ============================================================================
// Re-exported dependencies
// ============================================================================
// These re-exports let consumers use common dependencies without adding them
// explicitly to their own Cargo.toml, keeping versions in lock-step with this
// crate.

/// Re-export dashmap for concurrent hash maps
pub use dashmap;
/// Re-export parking_lot for efficient synchronization primitives
pub use parking_lot;
/// Re-export reqwest for HTTP client functionality
#[cfg(feature = "http-client")]
pub use reqwest;
/// Re-export serde for serialization
pub use serde;
/// Re-export serde_json for JSON handling
pub use serde_json;
/// Re-export tokio for async runtime
pub use tokio;
/// Re-export tracing for observability
pub use tracing;

/// Prelude module for convenient imports
pub mod prelude {
    /// Re-export agent service types
    pub use crate::agent::{AgentService, AgentStatus};
    /// Re-export broker types
    pub use crate::broker::{Broker, MemoryStore, Message, Store, Subject, Subscription};
    /// Re-export cache utilities
    pub use crate::cache::{Cache, CacheConfig, CacheKey, MemoryCache};
    /// Re-export the in-memory configuration surface
    pub use crate::config::Config;
    /// Re-export dispatcher types
    pub use crate::dispatcher::{Dispatcher, Worker};
    /// Re-export the error taxonomy
    pub use crate::error::{Error, Result};
    /// Re-export shutdown utilities
    pub use crate::shutdown::{
        GracefulShutdown, GracefulShutdownExt, ShutdownAwareTaskSpawner, ShutdownSignal,
        ShutdownToken,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_tcg_core_exists() {
        assert!(true);
    }
}
