//! Error types for bistro-queue operations.
//!
//! Defines error types for the three layers of the job subsystem:
//! - Broker connections (Redis command, publish and subscribe handles)
//! - Job queue operations (submission, lookup, lifecycle transitions)
//! - Liveness probing of the relational store and the broker
//!
//! Broker failures are carried through every layer unchanged so that callers
//! keep the original Redis diagnostic.

use thiserror::Error;

/// Errors raised by the broker connection handles.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis refused or failed the command. The original error is preserved.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The broker was closed; no further commands are accepted.
    #[error("Broker connection is closed")]
    Closed,

    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerError {
    /// Returns whether this error was caused by the broker being closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, BrokerError::Closed)
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue name must not be empty")]
    InvalidQueueName,

    #[error("Job {0} not found")]
    JobNotFound(String),

    /// A transition was requested for a job that is not in the source state,
    /// e.g. completing a job that is still waiting.
    #[error("Job {id} is not {expected}")]
    UnexpectedState { id: String, expected: &'static str },

    /// A stored job hash could not be decoded.
    #[error("Job {id} is malformed: {reason}")]
    MalformedJob { id: String, reason: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Broker(BrokerError::Redis(err))
    }
}

/// Errors reported by the liveness probe.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Database check failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker check failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("{component} check timed out after {timeout:?}")]
    Timeout {
        component: &'static str,
        timeout: std::time::Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_error_display() {
        let err = BrokerError::Closed;
        assert!(err.is_closed());
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_queue_error_keeps_broker_diagnostic() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::ResponseError, "OOM command not allowed"));
        let err: QueueError = redis_err.into();

        match &err {
            QueueError::Broker(BrokerError::Redis(inner)) => {
                assert_eq!(inner.kind(), redis::ErrorKind::ResponseError);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("OOM command not allowed"));
    }

    #[test]
    fn test_queue_error_display() {
        assert!(QueueError::InvalidQueueName.to_string().contains("empty"));
        assert!(QueueError::JobNotFound("42".into()).to_string().contains("42"));

        let err = QueueError::MalformedJob {
            id: "7".into(),
            reason: "missing field 'opts'".into(),
        };
        assert!(err.to_string().contains("missing field"));

        let err = QueueError::UnexpectedState {
            id: "8".into(),
            expected: "active",
        };
        assert_eq!(err.to_string(), "Job 8 is not active");
    }
}
