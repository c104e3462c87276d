//! Redis key layout of a named queue.
//!
//! All keys of queue `email` with prefix `bull` live under `bull:email:`:
//!
//! - `bull:email:id`: job id counter (`INCR`)
//! - `bull:email:{id}`: job hash
//! - `bull:email:wait`: ids waiting to be picked up (list)
//! - `bull:email:active`: ids being processed (list)
//! - `bull:email:delayed`: ids waiting for a retry, scored by due time (zset)
//! - `bull:email:completed` / `bull:email:failed`: finished ids, scored by finish order (zset)
//! - `bull:email:seq`: finish order counter (`INCR`)
//! - `bull:email:de:{dedup_id}`: deduplication claim holding a job id
//! - `bull:email:events`: pub/sub channel for lifecycle events

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    /// `"{prefix}:{queue}"`.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Prefix that a job id is appended to in order to form its hash key.
    pub fn job_prefix(&self) -> String {
        format!("{}:", self.base)
    }

    pub fn id_counter(&self) -> String {
        format!("{}:id", self.base)
    }

    /// Counter scoring the completed and failed sets, so retention evicts
    /// in finish order even when several jobs finish within one millisecond.
    pub fn finish_seq(&self) -> String {
        format!("{}:seq", self.base)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:{id}", self.base)
    }

    pub fn wait(&self) -> String {
        format!("{}:wait", self.base)
    }

    pub fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    pub fn completed(&self) -> String {
        format!("{}:completed", self.base)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    pub fn dedup(&self, dedup_id: &str) -> String {
        format!("{}:de:{dedup_id}", self.base)
    }

    pub fn events(&self) -> String {
        format!("{}:events", self.base)
    }
}
