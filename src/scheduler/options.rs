//! Retry, backoff and retention policy for jobs.
//!
//! A queue carries [`DefaultJobOptions`]; each submission may pass a
//! [`JobOptions`] whose set fields replace the matching defaults one by one.
//! The result, [`ResolvedJobOptions`], is what gets stored with the job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of attempts before a job is marked failed.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default base delay between attempts, in milliseconds.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 1000;

/// Default number of completed jobs kept in the broker.
pub const DEFAULT_KEEP_COMPLETED: u64 = 100;

/// Default number of failed jobs kept in the broker.
pub const DEFAULT_KEEP_FAILED: u64 = 1000;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffKind::Fixed => write!(f, "fixed"),
            BackoffKind::Exponential => write!(f, "exponential"),
        }
    }
}

/// Delay strategy applied between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Delay to wait before the retry that follows failed attempt `attempt`
    /// (1-based).
    ///
    /// Fixed backoff always waits `delay`. Exponential backoff waits
    /// `delay * 2^(attempt - 1)`, saturating at `u64::MAX` milliseconds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_DELAY_MS)
    }
}

/// Policy every job of a queue inherits unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub keep_completed: u64,
    pub keep_failed: u64,
}

impl Default for DefaultJobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::default(),
            keep_completed: DEFAULT_KEEP_COMPLETED,
            keep_failed: DEFAULT_KEEP_FAILED,
        }
    }
}

impl DefaultJobOptions {
    /// Applies per-job overrides field by field.
    ///
    /// A job is always allowed at least one attempt.
    pub fn merge(&self, overrides: &JobOptions) -> ResolvedJobOptions {
        ResolvedJobOptions {
            attempts: overrides.attempts.unwrap_or(self.attempts).max(1),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            keep_completed: overrides.keep_completed.unwrap_or(self.keep_completed),
            keep_failed: overrides.keep_failed.unwrap_or(self.keep_failed),
            dedup_id: overrides.dedup_id.clone(),
        }
    }
}

/// Optional queue-level configuration; unset fields keep the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub keep_completed: Option<u64>,
    pub keep_failed: Option<u64>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_keep_completed(mut self, count: u64) -> Self {
        self.keep_completed = Some(count);
        self
    }

    pub fn with_keep_failed(mut self, count: u64) -> Self {
        self.keep_failed = Some(count);
        self
    }

    /// Resolves the configuration against the built-in defaults.
    pub fn resolve(&self) -> DefaultJobOptions {
        let base = DefaultJobOptions::default();
        DefaultJobOptions {
            attempts: self.attempts.unwrap_or(base.attempts).max(1),
            backoff: self.backoff.unwrap_or(base.backoff),
            keep_completed: self.keep_completed.unwrap_or(base.keep_completed),
            keep_failed: self.keep_failed.unwrap_or(base.keep_failed),
        }
    }
}

/// Per-job overrides passed to `submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Job name; defaults to a name derived from the queue.
    pub name: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub keep_completed: Option<u64>,
    pub keep_failed: Option<u64>,
    /// While a job holding this id is stored, submitting another job with
    /// the same id returns the existing job instead.
    pub dedup_id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_keep_completed(mut self, count: u64) -> Self {
        self.keep_completed = Some(count);
        self
    }

    pub fn with_keep_failed(mut self, count: u64) -> Self {
        self.keep_failed = Some(count);
        self
    }

    pub fn with_dedup_id(mut self, id: impl Into<String>) -> Self {
        self.dedup_id = Some(id.into());
        self
    }
}

/// Options recorded with a job in the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub keep_completed: u64,
    pub keep_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let defaults = DefaultJobOptions::default();

        assert_eq!(defaults.attempts, 3);
        assert_eq!(defaults.backoff.kind, BackoffKind::Exponential);
        assert_eq!(defaults.backoff.delay, 1000);
        assert_eq!(defaults.keep_completed, 100);
        assert_eq!(defaults.keep_failed, 1000);
    }

    #[test]
    fn test_merge_without_overrides_inherits_defaults() {
        let defaults = QueueOptions::new()
            .with_backoff(Backoff::fixed(250))
            .with_keep_failed(50)
            .resolve();
        let resolved = defaults.merge(&JobOptions::new());

        assert_eq!(resolved.attempts, defaults.attempts);
        assert_eq!(resolved.backoff, defaults.backoff);
        assert_eq!(resolved.keep_completed, defaults.keep_completed);
        assert_eq!(resolved.keep_failed, 50);
        assert!(resolved.dedup_id.is_none());
    }

    #[test]
    fn test_merge_overrides_single_field() {
        let defaults = DefaultJobOptions::default();
        let resolved = defaults.merge(&JobOptions::new().with_attempts(5));

        assert_eq!(resolved.attempts, 5);
        assert_eq!(resolved.backoff, Backoff::exponential(1000));
        assert_eq!(resolved.keep_completed, 100);
        assert_eq!(resolved.keep_failed, 1000);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let resolved = DefaultJobOptions::default().merge(&JobOptions::new().with_attempts(0));
        assert_eq!(resolved.attempts, 1);
        assert_eq!(QueueOptions::new().with_attempts(0).resolve().attempts, 1);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = Backoff::exponential(1000);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff_saturates() {
        let backoff = Backoff::exponential(1000);
        assert_eq!(backoff.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(300);
        assert_eq!(backoff.delay_for(1), backoff.delay_for(7));
    }

    #[test]
    fn test_resolved_options_wire_format() {
        let resolved = DefaultJobOptions::default().merge(&JobOptions::new().with_dedup_id("order-9"));
        let json = serde_json::to_value(&resolved).expect("options should serialize");

        assert_eq!(json["attempts"], 3);
        assert_eq!(json["backoff"]["type"], "exponential");
        assert_eq!(json["backoff"]["delay"], 1000);
        assert_eq!(json["keepCompleted"], 100);
        assert_eq!(json["keepFailed"], 1000);
        assert_eq!(json["dedupId"], "order-9");
    }
}
