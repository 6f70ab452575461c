//! Job records and queue policies.

use chrono::{DateTime, Duration, Utc};
use coursehub_core::config::QueueConfig;
use coursehub_core::{CourseHubError, Result};
use serde::{Deserialize, Serialize};

/// Stored lifecycle state. "Delayed" is not stored: it is a waiting job whose
/// `run_at` lies in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CourseHubError::Validation(format!("Unknown job status '{other}'"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    /// Runs started so far, the current one included.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    /// 0..=100, reported by the handler.
    pub progress: u8,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub dedup_key: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.run_at > now
    }

    /// Deserialize the payload.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Run no earlier than `now + delay`. Ignored when `run_at` is set.
    pub delay: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub dedup_key: Option<String>,
    /// Overrides the queue's retry policy for this job.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// When the job first becomes eligible. Past instants mean "now".
    pub fn eligible_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match (self.run_at, self.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => now + delay,
            (None, None) => now,
        };
        at.max(now)
    }
}

/// Attempt limit and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::seconds(2),
        }
    }
}

/// Upper bound for a single retry delay.
pub const MAX_BACKOFF_MS: i64 = 60 * 60 * 1000;

impl RetryPolicy {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        let base_ms = i64::try_from(cfg.backoff_base_ms).unwrap_or(MAX_BACKOFF_MS);
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::milliseconds(base_ms.min(MAX_BACKOFF_MS)),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): base, 2×base, 4×base, … capped at [`MAX_BACKOFF_MS`].
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(62);
        let ms = self
            .backoff_base
            .num_milliseconds()
            .checked_mul(1_i64 << exp)
            .map_or(MAX_BACKOFF_MS, |ms| ms.clamp(0, MAX_BACKOFF_MS));
        Duration::milliseconds(ms)
    }
}

/// What `clean` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest completed jobs to keep regardless of age.
    pub keep_completed: u32,
    pub completed_max_age: Duration,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            completed_max_age: Duration::hours(24),
            failed_max_age: Duration::days(7),
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            keep_completed: cfg.keep_completed,
            completed_max_age: Duration::seconds(cfg.completed_max_age_secs as i64),
            failed_max_age: Duration::seconds(cfg.failed_max_age_secs as i64),
        }
    }
}

/// Counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Where a failed attempt left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { next_run_at: DateTime<Utc> },
    Exhausted,
}

/// Rows removed by `clean`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub completed_removed: usize,
    pub failed_removed: usize,
}
