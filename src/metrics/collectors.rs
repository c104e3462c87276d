//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{JOBS_SUBMITTED_TOTAL, JOB_EVENTS_TOTAL, QUEUE_JOBS};
use crate::scheduler::JobCounts;

/// Metrics collector for the job subsystem.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one `submit` call.
    pub fn record_submission(&self, queue: &str, success: bool) {
        let status = if success { "success" } else { "failure" };

        if let Some(submitted) = JOBS_SUBMITTED_TOTAL.get() {
            submitted.with_label_values(&[queue, status]).inc();
        }

        tracing::trace!(queue = queue, status = status, "Recorded submission metric");
    }

    /// Record a published lifecycle event.
    pub fn record_event(&self, queue: &str, event: &str) {
        if let Some(events) = JOB_EVENTS_TOTAL.get() {
            events.with_label_values(&[queue, event]).inc();
        }

        tracing::trace!(queue = queue, event = event, "Recorded job event metric");
    }

    /// Update the per-state job gauges of a queue.
    pub fn update_counts(&self, queue: &str, counts: &JobCounts) {
        let Some(gauge) = QUEUE_JOBS.get() else {
            return;
        };

        for (state, value) in [
            ("waiting", counts.waiting),
            ("active", counts.active),
            ("delayed", counts.delayed),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            gauge.with_label_values(&[queue, state]).set(value as f64);
        }
    }
}
