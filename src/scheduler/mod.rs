//! Background jobs backed by Redis.
//!
//! This module provides the producer side of the job subsystem:
//!
//! - **JobQueue**: typed facade binding a queue name to its default policy; `submit` records jobs durably
//! - **QueueEvents**: subscription to a queue's lifecycle events (completed, failed, stalled, ...)
//! - **LifecycleReporter**: bookkeeping used by worker processes to move jobs between states
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐                 ┌──────────────┐
//!   │   Producer   │                 │    Worker    │
//!   │ (API route)  │                 │  (external)  │
//!   └──────┬───────┘                 └──────┬───────┘
//!          │ JobQueue::submit               │ LifecycleReporter
//!          ▼                                ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │ Redis: {prefix}:{queue}:{id|wait|active|...}    │
//!   └───────────────────────┬─────────────────────────┘
//!                           │ {prefix}:{queue}:events
//!                           ▼
//!                    ┌──────────────┐
//!                    │ QueueEvents  │
//!                    └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bistro_queue::broker::Broker;
//! use bistro_queue::scheduler::{JobOptions, JobQueue};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Email { to: String, subject: String }
//!
//! let broker = Broker::from_env()?;
//! let queue = JobQueue::<Email>::new("email", &broker, None)?;
//!
//! let handle = queue
//!     .submit(&Email { to: "a@example.com".into(), subject: "hi".into() }, None)
//!     .await?;
//!
//! let retried = queue
//!     .submit(&Email { to: "b@example.com".into(), subject: "hi".into() },
//!             Some(JobOptions::new().with_attempts(5)))
//!     .await?;
//! ```

pub mod events;
pub mod job;
pub mod keys;
pub mod lifecycle;
pub mod options;
pub mod queue;

// Re-export main types for convenience
pub use events::{EventStream, JobEvent, QueueEvents};
pub use job::{default_job_name, JobCounts, JobHandle, JobRecord};
pub use keys::QueueKeys;
pub use lifecycle::{FailureOutcome, LifecycleReporter};
pub use options::{
    Backoff, BackoffKind, DefaultJobOptions, JobOptions, QueueOptions, ResolvedJobOptions,
};
pub use queue::JobQueue;
