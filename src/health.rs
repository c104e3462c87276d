//! Liveness probe for operational tooling.
//!
//! `GET /health` round-trips `SELECT 1` against the relational store and
//! `PING` against the broker. It answers `200 OK` only when both respond,
//! and `503 Service Unavailable` naming the failing component otherwise.
//! `GET /metrics` serves the Prometheus exposition on the same router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

use crate::broker::Broker;
use crate::error::HealthError;
use crate::metrics::metrics_handler;

/// Upper bound for each component check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/bistro";

/// Creates the relational pool without connecting; the probe triggers the
/// first connection.
pub fn lazy_database_pool(database_url: &str) -> Result<PgPool, HealthError> {
    Ok(PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(CHECK_TIMEOUT)
        .connect_lazy(database_url)?)
}

/// Status of one probed component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentStatus {
    fn from_result(result: Result<(), HealthError>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok",
                error: None,
            },
            Err(e) => Self {
                status: "error",
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Body of the `/health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: ComponentStatus,
    pub broker: ComponentStatus,
}

impl HealthReport {
    pub fn new(database: Result<(), HealthError>, broker: Result<(), HealthError>) -> Self {
        let database = ComponentStatus::from_result(database);
        let broker = ComponentStatus::from_result(broker);
        let status = if database.is_ok() && broker.is_ok() {
            "ok"
        } else {
            "unavailable"
        };
        Self {
            status,
            database,
            broker,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.database.is_ok() && self.broker.is_ok()
    }

    pub fn status_code(&self) -> StatusCode {
        if self.is_healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// A component the liveness probe round-trips.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> Result<(), HealthError>;
}

#[async_trait]
impl Probe for PgPool {
    async fn check(&self) -> Result<(), HealthError> {
        sqlx::query("SELECT 1").execute(self).await?;
        Ok(())
    }
}

#[async_trait]
impl Probe for Broker {
    async fn check(&self) -> Result<(), HealthError> {
        self.ping().await?;
        Ok(())
    }
}

/// Shared state of the probe router.
#[derive(Clone)]
pub struct HealthState {
    database: Arc<dyn Probe>,
    broker: Arc<dyn Probe>,
}

impl HealthState {
    pub fn new(database: PgPool, broker: Broker) -> Self {
        Self::with_probes(Arc::new(database), Arc::new(broker))
    }

    pub(crate) fn with_probes(database: Arc<dyn Probe>, broker: Arc<dyn Probe>) -> Self {
        Self { database, broker }
    }

    /// Runs both checks concurrently, each bounded by a timeout.
    pub async fn probe(&self) -> HealthReport {
        let (database, broker) = tokio::join!(
            bounded(self.database.check(), "database"),
            bounded(self.broker.check(), "broker"),
        );
        HealthReport::new(database, broker)
    }
}

async fn bounded(
    check: impl std::future::Future<Output = Result<(), HealthError>>,
    component: &'static str,
) -> Result<(), HealthError> {
    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(result) => result,
        Err(_) => {
            warn!(component, timeout_ms = CHECK_TIMEOUT.as_millis() as u64, "Health check timed out");
            Err(HealthError::Timeout {
                component,
                timeout: CHECK_TIMEOUT,
            })
        }
    }
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.probe().await;
    if !report.is_healthy() {
        warn!(
            database = ?report.database.error,
            broker = ?report.broker.error,
            "Health check failed"
        );
    }
    (report.status_code(), Json(report))
}

/// Router exposing `/health` and `/metrics`.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
