//! Typed producer facade over a Redis-backed job queue.
//!
//! A [`JobQueue<T>`] binds a queue name to the broker and to the queue's
//! default retry, backoff and retention policy. Its one producer operation is
//! [`submit`](JobQueue::submit), which records a job durably before
//! returning.
//!
//! # Submission
//!
//! A single Lua script runs on the command connection and atomically:
//!
//! 1. returns the existing job id if the job carries a deduplication id that
//!    is already claimed, otherwise
//! 2. allocates the next id from `{queue}:id`,
//! 3. writes the job hash (name, data, opts, timestamp, attemptsMade),
//! 4. pushes the id onto `{queue}:wait`,
//! 5. claims the deduplication key, if any.
//!
//! The script is the only serialization point, so facades in different
//! processes need no coordination. Processing is left to a separate worker
//! attached to the same queue name.
//!
//! # Timeouts
//!
//! Submission cannot be cancelled once the script has been sent. A caller
//! that wraps `submit` in a timeout must treat an elapsed timeout as an
//! unknown outcome: the job may have been recorded even though no handle was
//! returned.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::OnceLock;

use redis::Script;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::events::{JobEvent, QueueEvents};
use super::job::{default_job_name, fields, JobCounts, JobHandle, JobRecord};
use super::keys::QueueKeys;
use super::options::{DefaultJobOptions, JobOptions, QueueOptions};
use crate::broker::{Broker, CommandConnection, PublisherConnection};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// KEYS: id counter, wait list, dedup key ("" when unused).
/// ARGV: job key prefix, name, data, opts, timestamp.
/// Returns `{id, created}`.
const SUBMIT_SCRIPT: &str = r#"
if KEYS[3] ~= "" then
  local existing = redis.call("GET", KEYS[3])
  if existing then
    return {existing, 0}
  end
end
local id = tostring(redis.call("INCR", KEYS[1]))
redis.call("HSET", ARGV[1] .. id,
  "name", ARGV[2], "data", ARGV[3], "opts", ARGV[4],
  "timestamp", ARGV[5], "attemptsMade", 0)
redis.call("LPUSH", KEYS[2], id)
if KEYS[3] ~= "" then
  redis.call("SET", KEYS[3], id)
end
return {id, 1}
"#;

/// KEYS: job hash, wait, active, delayed, completed, failed, dedup key ("" when unused).
/// ARGV: job id. Returns 1 if the job existed.
const REMOVE_SCRIPT: &str = r#"
local existed = redis.call("DEL", KEYS[1])
redis.call("LREM", KEYS[2], 0, ARGV[1])
redis.call("LREM", KEYS[3], 0, ARGV[1])
redis.call("ZREM", KEYS[4], ARGV[1])
redis.call("ZREM", KEYS[5], ARGV[1])
redis.call("ZREM", KEYS[6], ARGV[1])
if KEYS[7] ~= "" and redis.call("GET", KEYS[7]) == ARGV[1] then
  redis.call("DEL", KEYS[7])
end
return existed
"#;

static SUBMIT: OnceLock<Script> = OnceLock::new();
static REMOVE: OnceLock<Script> = OnceLock::new();

/// Returns the script held in `cell`, hashing `source` on first use only.
pub(crate) fn cached_script(cell: &'static OnceLock<Script>, source: &str) -> &'static Script {
    cell.get_or_init(|| Script::new(source))
}

/// Loads and decodes one job hash.
pub(crate) async fn fetch_job(
    commands: &CommandConnection,
    keys: &QueueKeys,
    id: &str,
) -> Result<Option<JobRecord>, QueueError> {
    let hash: HashMap<String, String> = commands
        .query(redis::cmd("HGETALL").arg(keys.job(id)))
        .await?;

    if hash.is_empty() {
        return Ok(None);
    }
    JobRecord::from_hash(id, hash).map(Some)
}

/// Hash fields of one submission, as written by the submit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PreparedJob {
    pub name: String,
    /// Payload JSON.
    pub data: String,
    /// Resolved options JSON.
    pub opts: String,
    pub dedup_id: Option<String>,
}

/// Producer facade for one named queue carrying payloads of type `T`.
///
/// The facade owns its event stream; both are released together when the
/// facade is dropped or [`close`](JobQueue::close)d. Several facades with the
/// same name share the same durable state.
pub struct JobQueue<T> {
    name: String,
    keys: QueueKeys,
    defaults: DefaultJobOptions,
    commands: CommandConnection,
    publisher: PublisherConnection,
    events: QueueEvents,
    metrics: MetricsCollector,
    _payload: PhantomData<fn(T)>,
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Binds a queue to the broker.
    ///
    /// `options` overrides any of the built-in defaults (3 attempts,
    /// exponential backoff from 1000 ms, keep 100 completed and 1000 failed
    /// jobs). The event stream is bound to the broker's subscribe-only
    /// connection, but its subscription only opens at
    /// [`QueueEvents::subscribe`]. Pub/sub keeps no backlog, so events
    /// published between `new` and `subscribe` are not delivered; subscribe
    /// before submitting when every event of a job matters.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidQueueName` for an empty name.
    pub fn new(
        name: impl Into<String>,
        broker: &Broker,
        options: Option<QueueOptions>,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::InvalidQueueName);
        }

        let defaults = options.unwrap_or_default().resolve();
        let keys = QueueKeys::new(broker.prefix(), &name);
        let events = QueueEvents::new(&name, broker.prefix(), broker.subscriber());

        debug!(
            queue = %name,
            attempts = defaults.attempts,
            backoff = %defaults.backoff.kind,
            backoff_delay_ms = defaults.backoff.delay,
            "Job queue bound"
        );

        Ok(Self {
            name,
            keys,
            defaults,
            commands: broker.commands(),
            publisher: broker.publisher(),
            events,
            metrics: MetricsCollector::new(),
            _payload: PhantomData,
        })
    }

    /// Records a new job and returns its handle once the broker acknowledged it.
    ///
    /// Fields set in `options` replace the queue defaults one by one; unset
    /// fields inherit them. Without an explicit name the job is named
    /// `"__default__:{queue}"`.
    ///
    /// If `options` carries a deduplication id that is still claimed by a
    /// stored job, no job is created and the existing job's handle is
    /// returned with `deduplicated` set.
    ///
    /// # Errors
    ///
    /// Broker failures (closed connection, rejected write, authentication)
    /// are returned unchanged as `QueueError::Broker`.
    pub async fn submit(
        &self,
        payload: &T,
        options: Option<JobOptions>,
    ) -> Result<JobHandle, QueueError> {
        let options = options.unwrap_or_default();
        let result = match self.prepare(payload, &options) {
            Ok(job) => self.record(&job).await.map(|recorded| (job, recorded)),
            Err(e) => Err(e),
        };
        self.metrics.record_submission(&self.name, result.is_ok());
        let (job, (id, created)) = result?;

        let handle = JobHandle {
            id,
            name: job.name,
            queue: self.name.clone(),
            deduplicated: !created,
        };

        if created {
            info!(queue = %self.name, job_id = %handle.id, name = %handle.name, "Job submitted");
            self.announce(&handle).await;
        } else {
            info!(
                queue = %self.name,
                job_id = %handle.id,
                dedup_id = ?job.dedup_id,
                "Job deduplicated"
            );
        }

        Ok(handle)
    }

    /// Builds the fields a submission writes, merging `options` over the
    /// queue defaults. Touches no connection.
    pub(crate) fn prepare(
        &self,
        payload: &T,
        options: &JobOptions,
    ) -> Result<PreparedJob, QueueError> {
        let resolved = self.defaults.merge(options);
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| default_job_name(&self.name));

        Ok(PreparedJob {
            name,
            data: serde_json::to_string(payload)?,
            opts: serde_json::to_string(&resolved)?,
            dedup_id: resolved.dedup_id,
        })
    }

    async fn record(&self, job: &PreparedJob) -> Result<(String, bool), QueueError> {
        let dedup_key = job
            .dedup_id
            .as_deref()
            .map(|id| self.keys.dedup(id))
            .unwrap_or_default();
        let timestamp = chrono::Utc::now().timestamp_millis();

        let mut invocation = cached_script(&SUBMIT, SUBMIT_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.id_counter())
            .key(self.keys.wait())
            .key(dedup_key)
            .arg(self.keys.job_prefix())
            .arg(&job.name)
            .arg(&job.data)
            .arg(&job.opts)
            .arg(timestamp);

        let (id, created): (String, i64) = self.commands.invoke(&invocation).await?;
        Ok((id, created == 1))
    }

    /// Publishes the `added` event. The job is already durable at this point,
    /// so a failed publish is logged rather than reported as a failed submit.
    async fn announce(&self, handle: &JobHandle) {
        let event = JobEvent::Added {
            job_id: handle.id.clone(),
            name: handle.name.clone(),
        };

        let result = match event.encode() {
            Ok(message) => self
                .publisher
                .publish(self.events.channel(), &message)
                .await
                .map_err(QueueError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => self.metrics.record_event(&self.name, event.kind()),
            Err(e) => warn!(
                queue = %self.name,
                job_id = %handle.id,
                error = %e,
                "Job recorded but added event was not published"
            ),
        }
    }

    /// Retrieves a stored job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        fetch_job(&self.commands, &self.keys, id).await
    }

    /// Returns the number of jobs in each state.
    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut pipe = redis::pipe();
        pipe.llen(self.keys.wait())
            .llen(self.keys.active())
            .zcard(self.keys.delayed())
            .zcard(self.keys.completed())
            .zcard(self.keys.failed());

        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            self.commands.query_pipeline(&pipe).await?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    /// Removes a job and all references to it, releasing its deduplication id.
    ///
    /// Returns `false` if no such job was stored.
    pub async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        let dedup_key = match self.get_job(id).await? {
            Some(record) => record
                .opts
                .dedup_id
                .as_deref()
                .map(|dedup| self.keys.dedup(dedup))
                .unwrap_or_default(),
            None => String::new(),
        };

        let mut invocation = cached_script(&REMOVE, REMOVE_SCRIPT).prepare_invoke();
        invocation
            .key(self.keys.job(id))
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(dedup_key)
            .arg(id);

        let existed: i64 = self.commands.invoke(&invocation).await?;
        if existed == 1 {
            info!(queue = %self.name, job_id = %id, "Job removed");
        }
        Ok(existed == 1)
    }

    /// Releases the facade together with its event stream.
    ///
    /// The shared broker connections stay open for other facades.
    pub fn close(self) {
        debug!(queue = %self.name, "Job queue released");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy applied to jobs submitted without overrides.
    pub fn defaults(&self) -> &DefaultJobOptions {
        &self.defaults
    }

    /// The event stream bound to this queue.
    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

impl<T> std::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}
