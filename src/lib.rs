//! bistro-queue: Redis-backed background jobs for the bistro store platform.
//!
//! This library provides the broker connection layer, typed job queues with
//! default retry policies, lifecycle event subscriptions, and a liveness
//! probe for operational tooling.

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, HealthError, QueueError};
