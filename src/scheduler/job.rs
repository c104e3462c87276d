//! Job records as stored in the broker.
//!
//! - `JobRecord`: decoded job hash (name, payload, options, progress)
//! - `JobHandle`: what `submit` hands back to the producer
//! - `JobCounts`: number of jobs per state for one queue

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::options::ResolvedJobOptions;
use crate::error::QueueError;

/// Name given to jobs submitted without an explicit name.
const DEFAULT_NAME_PREFIX: &str = "__default__";

/// Hash field names of a stored job.
pub(crate) mod fields {
    pub const NAME: &str = "name";
    pub const DATA: &str = "data";
    pub const OPTS: &str = "opts";
    pub const TIMESTAMP: &str = "timestamp";
    pub const ATTEMPTS_MADE: &str = "attemptsMade";
    pub const FAILED_REASON: &str = "failedReason";
    pub const RETURN_VALUE: &str = "returnvalue";
    pub const FINISHED_ON: &str = "finishedOn";
}

/// Derives the job name used when the producer does not supply one.
///
/// The name is scoped to the queue, so it is stable across calls and
/// distinct between queues.
pub fn default_job_name(queue: &str) -> String {
    format!("{DEFAULT_NAME_PREFIX}:{queue}")
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub name: String,
    pub queue: String,
    /// `true` when the submission matched an existing deduplication id and
    /// no new job was created.
    pub deduplicated: bool,
}

/// A job as recorded in the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: ResolvedJobOptions,
    /// Submission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub finished_on: Option<i64>,
}

impl JobRecord {
    /// Decodes a job hash as returned by `HGETALL`.
    pub fn from_hash(id: &str, mut hash: HashMap<String, String>) -> Result<Self, QueueError> {
        let malformed = |reason: String| QueueError::MalformedJob {
            id: id.to_string(),
            reason,
        };
        let mut required = |field: &str| {
            hash.remove(field)
                .ok_or_else(|| malformed(format!("missing field '{field}'")))
        };

        let name = required(fields::NAME)?;
        let data = required(fields::DATA)?;
        let opts = required(fields::OPTS)?;
        let timestamp = required(fields::TIMESTAMP)?;

        let data = serde_json::from_str(&data)
            .map_err(|e| malformed(format!("invalid data: {e}")))?;
        let opts = serde_json::from_str(&opts)
            .map_err(|e| malformed(format!("invalid opts: {e}")))?;
        let timestamp = timestamp
            .parse()
            .map_err(|_| malformed(format!("invalid timestamp '{timestamp}'")))?;

        let attempts_made = match hash.remove(fields::ATTEMPTS_MADE) {
            Some(value) => value
                .parse()
                .map_err(|_| malformed(format!("invalid attemptsMade '{value}'")))?,
            None => 0,
        };
        let return_value = match hash.remove(fields::RETURN_VALUE) {
            Some(value) => Some(
                serde_json::from_str(&value)
                    .map_err(|e| malformed(format!("invalid returnvalue: {e}")))?,
            ),
            None => None,
        };
        let finished_on = match hash.remove(fields::FINISHED_ON) {
            Some(value) => Some(
                value
                    .parse()
                    .map_err(|_| malformed(format!("invalid finishedOn '{value}'")))?,
            ),
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            name,
            data,
            opts,
            timestamp,
            attempts_made,
            failed_reason: hash.remove(fields::FAILED_REASON),
            return_value,
            finished_on,
        })
    }

    /// Deserializes the payload into the queue's job-data type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Whether another attempt is allowed after the current one failed.
    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.opts.attempts.saturating_sub(self.attempts_made)
    }
}

/// Number of jobs in each state of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::options::{BackoffKind, DefaultJobOptions, JobOptions};

    fn stored_hash() -> HashMap<String, String> {
        let opts = DefaultJobOptions::default().merge(&JobOptions::new());
        HashMap::from([
            ("name".to_string(), default_job_name("email")),
            ("data".to_string(), r#"{"to":"a@example.com","subject":"hi"}"#.to_string()),
            ("opts".to_string(), serde_json::to_string(&opts).expect("opts serialize")),
            ("timestamp".to_string(), "1760600000000".to_string()),
            ("attemptsMade".to_string(), "0".to_string()),
        ])
    }

    #[test]
    fn test_default_job_name_is_queue_scoped() {
        assert_eq!(default_job_name("email"), default_job_name("email"));
        assert_ne!(default_job_name("email"), default_job_name("sms"));
        assert!(default_job_name("email").contains("email"));
    }

    #[test]
    fn test_record_from_hash() {
        let record = JobRecord::from_hash("1", stored_hash()).expect("hash should decode");

        assert_eq!(record.id, "1");
        assert_eq!(record.name, "__default__:email");
        assert_eq!(record.data["to"], "a@example.com");
        assert_eq!(record.opts.attempts, 3);
        assert_eq!(record.opts.backoff.kind, BackoffKind::Exponential);
        assert_eq!(record.opts.backoff.delay, 1000);
        assert_eq!(record.timestamp, 1_760_600_000_000);
        assert_eq!(record.attempts_made, 0);
        assert!(record.failed_reason.is_none());
        assert!(record.finished_on.is_none());
    }

    #[test]
    fn test_record_payload_is_typed() {
        #[derive(Deserialize)]
        struct Email {
            to: String,
            subject: String,
        }

        let record = JobRecord::from_hash("1", stored_hash()).expect("hash should decode");
        let email: Email = record.payload().expect("payload should decode");

        assert_eq!(email.to, "a@example.com");
        assert_eq!(email.subject, "hi");
    }

    #[test]
    fn test_record_missing_field() {
        let mut hash = stored_hash();
        hash.remove("opts");

        let err = JobRecord::from_hash("3", hash).expect_err("opts is required");
        assert!(matches!(err, QueueError::MalformedJob { ref id, .. } if id == "3"));
        assert!(err.to_string().contains("opts"));
    }

    #[test]
    fn test_record_retry_accounting() {
        let mut hash = stored_hash();
        hash.insert("attemptsMade".into(), "2".into());
        let record = JobRecord::from_hash("1", hash.clone()).expect("hash should decode");
        assert!(record.should_retry());
        assert_eq!(record.remaining_attempts(), 1);

        hash.insert("attemptsMade".into(), "3".into());
        let record = JobRecord::from_hash("1", hash).expect("hash should decode");
        assert!(!record.should_retry());
        assert_eq!(record.remaining_attempts(), 0);
    }

    #[test]
    fn test_job_counts_total() {
        let counts = JobCounts {
            waiting: 4,
            active: 1,
            delayed: 2,
            completed: 10,
            failed: 3,
        };
        assert_eq!(counts.total(), 20);
    }
}
