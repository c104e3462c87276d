//! Metrics module for Prometheus-based monitoring.
//!
//! Counts job submissions and lifecycle events per queue and exposes the
//! number of jobs in each state.
//!
//! # Example
//!
//! ```ignore
//! use bistro_queue::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_submission("email", true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
pub use prometheus::{JOBS_SUBMITTED_TOTAL, JOB_EVENTS_TOTAL, QUEUE_JOBS, REGISTRY};
