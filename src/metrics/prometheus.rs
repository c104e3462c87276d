//! Prometheus metrics registration and export.
//!
//! Defines the metrics of the job subsystem and provides functions for
//! initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all bistro-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs submitted, labeled by queue and status (success/failure).
pub static JOBS_SUBMITTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Lifecycle events published, labeled by queue and event kind.
pub static JOB_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs per state, labeled by queue and state.
pub static QUEUE_JOBS: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_submitted_total = CounterVec::new(
        Opts::new("bistro_jobs_submitted_total", "Total number of job submissions"),
        &["queue", "status"],
    )?;

    let job_events_total = CounterVec::new(
        Opts::new("bistro_job_events_total", "Total number of job lifecycle events published"),
        &["queue", "event"],
    )?;

    let queue_jobs = GaugeVec::new(
        Opts::new("bistro_queue_jobs", "Number of jobs in each state"),
        &["queue", "state"],
    )?;

    registry.register(Box::new(jobs_submitted_total.clone()))?;
    registry.register(Box::new(job_events_total.clone()))?;
    registry.register(Box::new(queue_jobs.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED_TOTAL.set(jobs_submitted_total);
    let _ = JOB_EVENTS_TOTAL.set(job_events_total);
    let _ = QUEUE_JOBS.set(queue_jobs);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
