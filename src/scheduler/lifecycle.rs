//! Worker-side recording of job lifecycle transitions.
//!
//! The worker process that executes jobs is not part of this crate, but it
//! has to move jobs through their states the same way every time. A
//! [`LifecycleReporter`] does that bookkeeping against the queue's keys and
//! publishes the matching [`JobEvent`] on the publish-only connection:
//!
//! ```text
//! wait ──mark_active──▶ active ──mark_completed──▶ completed (trimmed to keep_completed)
//!   ▲                     │
//!   │                     ├──mark_failed, attempts left──▶ delayed ──promote_delayed──▶ wait
//!   │                     ├──mark_failed, exhausted──────▶ failed (trimmed to keep_failed)
//!   └────mark_stalled─────┘
//! ```

use std::sync::OnceLock;

use redis::Script;
use tracing::{info, warn};

use super::events::JobEvent;
use super::job::{fields, JobRecord};
use super::keys::QueueKeys;
use super::queue::{cached_script, fetch_job};
use crate::broker::{Broker, CommandConnection, PublisherConnection};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Script reply for a job hash that does not exist.
const MISSING: i64 = -1;

/// Script reply for a job that is not in the transition's source state.
const WRONG_STATE: i64 = -2;

/// KEYS: wait, active, job hash. ARGV: id.
/// Returns the new attempt count.
const ACTIVATE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[3]) == 0 then
  return -1
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return -2
end
redis.call("LPUSH", KEYS[2], ARGV[1])
return redis.call("HINCRBY", KEYS[3], "attemptsMade", 1)
"#;

/// KEYS: active, finished zset, job hash, dedup key ("" when unused), finish counter.
/// ARGV: id, finished-at ms, result field, result value, keep count, job key prefix.
/// Returns the number of evicted jobs.
const FINISH_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[3]) == 0 then
  return -1
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return -2
end
redis.call("ZADD", KEYS[2], redis.call("INCR", KEYS[5]), ARGV[1])
redis.call("HSET", KEYS[3], ARGV[3], ARGV[4], "finishedOn", ARGV[2])
if KEYS[4] ~= "" and redis.call("GET", KEYS[4]) == ARGV[1] then
  redis.call("DEL", KEYS[4])
end
local excess = redis.call("ZCARD", KEYS[2]) - tonumber(ARGV[5])
if excess <= 0 then
  return 0
end
local evicted = redis.call("ZRANGE", KEYS[2], 0, excess - 1)
for _, old in ipairs(evicted) do
  redis.call("DEL", ARGV[6] .. old)
end
redis.call("ZREMRANGEBYRANK", KEYS[2], 0, excess - 1)
return excess
"#;

/// KEYS: active, delayed, job hash. ARGV: id, due-at ms, reason.
const RETRY_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[3]) == 0 then
  return -1
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return -2
end
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[1])
redis.call("HSET", KEYS[3], "failedReason", ARGV[3])
return 1
"#;

/// KEYS: active, wait, job hash. ARGV: id.
const STALL_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[3]) == 0 then
  return -1
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return -2
end
redis.call("RPUSH", KEYS[2], ARGV[1])
return 1
"#;

/// KEYS: delayed, wait. ARGV: now ms. Returns the number of promoted jobs.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, id in ipairs(due) do
  redis.call("ZREM", KEYS[1], id)
  redis.call("LPUSH", KEYS[2], id)
end
return #due
"#;

static ACTIVATE: OnceLock<Script> = OnceLock::new();
static FINISH: OnceLock<Script> = OnceLock::new();
static RETRY: OnceLock<Script> = OnceLock::new();
static STALL: OnceLock<Script> = OnceLock::new();
static PROMOTE: OnceLock<Script> = OnceLock::new();

/// Maps a transition script reply to the job's outcome.
fn check_transition(id: &str, reply: i64, expected: &'static str) -> Result<i64, QueueError> {
    match reply {
        MISSING => Err(QueueError::JobNotFound(id.to_string())),
        WRONG_STATE => Err(QueueError::UnexpectedState {
            id: id.to_string(),
            expected,
        }),
        reply => Ok(reply),
    }
}

/// What happened to a job reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another attempt is scheduled after `delay_ms`.
    Retrying { delay_ms: u64 },
    /// Attempts are exhausted; the job is kept in the failed set.
    Failed { evicted: u64 },
}

/// Records transitions of jobs in one queue and publishes their events.
#[derive(Clone)]
pub struct LifecycleReporter {
    queue: String,
    keys: QueueKeys,
    commands: CommandConnection,
    publisher: PublisherConnection,
    metrics: MetricsCollector,
}

impl LifecycleReporter {
    pub fn new(queue: impl Into<String>, broker: &Broker) -> Self {
        let queue = queue.into();
        Self {
            keys: QueueKeys::new(broker.prefix(), &queue),
            queue,
            commands: broker.commands(),
            publisher: broker.publisher(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Moves a job from wait to active and counts the attempt.
    ///
    /// Returns the attempt number now running (1-based), or
    /// `QueueError::UnexpectedState` if the job is not waiting.
    pub async fn mark_active(&self, id: &str) -> Result<u32, QueueError> {
        let mut invocation = cached_script(&ACTIVATE, ACTIVATE_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.job(id))
            .arg(id);

        let reply: i64 = self.commands.invoke(&invocation).await?;
        let attempt = check_transition(id, reply, "waiting")?;
        info!(queue = %self.queue, job_id = %id, attempt, "Job active");
        Ok(attempt as u32)
    }

    /// Marks an active job completed, stores its return value and trims the
    /// completed set to the job's retention count.
    ///
    /// Returns the number of older completed jobs evicted. Jobs are evicted
    /// in the order they finished.
    pub async fn mark_completed(
        &self,
        id: &str,
        return_value: serde_json::Value,
    ) -> Result<u64, QueueError> {
        let record = self.require(id).await?;
        let encoded = serde_json::to_string(&return_value)?;

        let evicted = self
            .finish(
                &record,
                &self.keys.completed(),
                fields::RETURN_VALUE,
                &encoded,
                record.opts.keep_completed,
            )
            .await?;

        info!(queue = %self.queue, job_id = %id, evicted, "Job completed");
        self.emit(JobEvent::Completed {
            job_id: id.to_string(),
            return_value,
        })
        .await?;
        Ok(evicted)
    }

    /// Reports a failed attempt of an active job.
    ///
    /// While attempts remain, the job is parked in the delayed set for the
    /// backoff delay of this attempt and a `retrying` event is published.
    /// Otherwise it moves to the failed set, which is trimmed to the job's
    /// retention count, and a `failed` event is published.
    ///
    /// Nothing is published if the job vanished or is not active.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<FailureOutcome, QueueError> {
        let record = self.require(id).await?;

        if record.should_retry() {
            let delay = record.opts.backoff.delay_for(record.attempts_made);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            let due = chrono::Utc::now()
                .timestamp_millis()
                .saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX));

            let mut invocation = cached_script(&RETRY, RETRY_SCRIPT).prepare_invoke();
            invocation
                .key(self.keys.active())
                .key(self.keys.delayed())
                .key(self.keys.job(id))
                .arg(id)
                .arg(due)
                .arg(reason);
            let reply: i64 = self.commands.invoke(&invocation).await?;
            check_transition(id, reply, "active")?;

            warn!(
                queue = %self.queue,
                job_id = %id,
                reason = %reason,
                delay_ms,
                remaining_attempts = record.remaining_attempts(),
                "Job failed, retry scheduled"
            );
            self.emit(JobEvent::Retrying {
                job_id: id.to_string(),
                reason: reason.to_string(),
                delay_ms,
            })
            .await?;
            return Ok(FailureOutcome::Retrying { delay_ms });
        }

        let evicted = self
            .finish(
                &record,
                &self.keys.failed(),
                fields::FAILED_REASON,
                reason,
                record.opts.keep_failed,
            )
            .await?;

        warn!(
            queue = %self.queue,
            job_id = %id,
            reason = %reason,
            attempts_made = record.attempts_made,
            "Job failed, attempts exhausted"
        );
        self.emit(JobEvent::Failed {
            job_id: id.to_string(),
            reason: reason.to_string(),
            attempts_made: record.attempts_made,
        })
        .await?;
        Ok(FailureOutcome::Failed { evicted })
    }

    /// Returns an active job whose worker went away back to the wait list.
    ///
    /// Jobs that are not active are left alone, so a job is never queued twice.
    pub async fn mark_stalled(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let mut invocation = cached_script(&STALL, STALL_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.job(id))
            .arg(id);

        let reply: i64 = self.commands.invoke(&invocation).await?;
        check_transition(id, reply, "active")?;

        warn!(queue = %self.queue, job_id = %id, reason = %reason, "Job stalled");
        self.emit(JobEvent::Stalled {
            job_id: id.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    /// Moves delayed jobs whose retry time has passed back to the wait list.
    pub async fn promote_delayed(&self) -> Result<u64, QueueError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut invocation = cached_script(&PROMOTE, PROMOTE_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .arg(now);

        let promoted: u64 = self.commands.invoke(&invocation).await?;
        if promoted > 0 {
            info!(queue = %self.queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn require(&self, id: &str) -> Result<JobRecord, QueueError> {
        fetch_job(&self.commands, &self.keys, id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    async fn finish(
        &self,
        record: &JobRecord,
        finished_key: &str,
        result_field: &str,
        result_value: &str,
        keep: u64,
    ) -> Result<u64, QueueError> {
        let dedup_key = record
            .opts
            .dedup_id
            .as_deref()
            .map(|dedup| self.keys.dedup(dedup))
            .unwrap_or_default();

        let mut invocation = cached_script(&FINISH, FINISH_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(finished_key)
            .key(self.keys.job(&record.id))
            .key(dedup_key)
            .key(self.keys.finish_seq())
            .arg(&record.id)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(result_field)
            .arg(result_value)
            .arg(keep)
            .arg(self.keys.job_prefix());

        let reply: i64 = self.commands.invoke(&invocation).await?;
        let evicted = check_transition(&record.id, reply, "active")?;
        Ok(evicted as u64)
    }

    async fn emit(&self, event: JobEvent) -> Result<(), QueueError> {
        let message = event.encode()?;
        self.publisher.publish(&self.keys.events(), &message).await?;
        self.metrics.record_event(&self.queue, event.kind());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::error::BrokerError;

    #[tokio::test]
    async fn test_reporter_targets_queue_keys() {
        let broker = Broker::new(BrokerConfig::default().with_prefix("bistro")).expect("broker should build");
        let reporter = LifecycleReporter::new("orders", &broker);

        assert_eq!(reporter.queue_name(), "orders");
        assert_eq!(reporter.keys.events(), "bistro:orders:events");
    }

    #[test]
    fn test_check_transition_maps_script_replies() {
        assert_eq!(check_transition("3", 2, "waiting").expect("valid reply"), 2);
        assert_eq!(check_transition("3", 0, "active").expect("nothing evicted"), 0);

        let err = check_transition("3", MISSING, "waiting").expect_err("job is gone");
        assert!(matches!(err, QueueError::JobNotFound(ref id) if id == "3"));

        let err = check_transition("3", WRONG_STATE, "active").expect_err("job is elsewhere");
        assert!(matches!(
            err,
            QueueError::UnexpectedState { ref id, expected: "active" } if id == "3"
        ));
    }

    #[test]
    fn test_transition_scripts_check_source_state() {
        for source in [ACTIVATE_SCRIPT, FINISH_SCRIPT, RETRY_SCRIPT, STALL_SCRIPT] {
            assert!(source.contains(r#"if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then"#));
            assert!(source.contains("return -2"));
        }
    }

    #[test]
    fn test_finished_sets_are_scored_by_counter() {
        assert!(FINISH_SCRIPT.contains(r#"redis.call("ZADD", KEYS[2], redis.call("INCR", KEYS[5]), ARGV[1])"#));
    }

    #[test]
    fn test_lifecycle_scripts_are_cached() {
        let first = cached_script(&FINISH, FINISH_SCRIPT);
        let second = cached_script(&FINISH, FINISH_SCRIPT);
        assert!(std::ptr::eq(first, second));
    }

    #[tokio::test]
    async fn test_transitions_fail_on_closed_broker() {
        let broker = Broker::new(BrokerConfig::default().with_port(1)).expect("broker should build");
        let reporter = LifecycleReporter::new("orders", &broker);
        broker.close().await;

        let err = reporter.mark_active("1").await.expect_err("broker is closed");
        assert!(matches!(err, QueueError::Broker(BrokerError::Closed)));

        let err = reporter
            .mark_failed("1", "boom")
            .await
            .expect_err("broker is closed");
        assert!(matches!(err, QueueError::Broker(BrokerError::Closed)));

        assert!(reporter.promote_delayed().await.is_err());
    }
}
