//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Job Identifier: `"{job_type}:{content_hash}:{millis}"`
pub type JobId = String;

/// Lifecycle state derived from a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted with a delay that has not elapsed yet
    Scheduled,
    /// Eligible for dispatch
    Waiting,
    /// Popped by a worker and being processed
    Active,
    /// Failed at least once, waiting out its backoff
    Retrying,
    /// Successfully completed
    Completed,
    /// Permanently failed after exhausting its attempts
    Failed,
}

/// Caller-supplied submission options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Postpone initial eligibility
    pub delay: Option<Duration>,
    /// Higher values dispatch earlier among eligible jobs
    pub priority: Option<i32>,
    /// Ceiling on dispatch attempts; falls back to the queue default
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The delay, with a zero duration treated as no delay
    pub(crate) fn effective_delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}

/// A persisted job record. The store entry under `job:{id}` is the single
/// source of truth for its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// When the job was last scheduled to become eligible
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Initial delay in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl Job {
    pub(crate) fn new(
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: &JobOptions,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = options.effective_delay();
        let run_at = match delay {
            Some(d) => chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => now,
        };

        Self {
            id: make_job_id(job_type, &payload, now.timestamp_millis()),
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            run_at,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            delay: delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            priority: options.priority,
        }
    }

    /// Derive the lifecycle state from the record's timestamps
    pub fn status_at(&self, now: DateTime<Utc>) -> JobStatus {
        if self.completed_at.is_some() {
            return JobStatus::Completed;
        }

        let in_flight = match (self.processed_at, self.failed_at) {
            (Some(processed), Some(failed)) => processed > failed,
            (Some(_), None) => true,
            _ => false,
        };
        if in_flight {
            return JobStatus::Active;
        }

        if self.failed_at.is_some() {
            if self.attempts >= self.max_attempts {
                JobStatus::Failed
            } else {
                JobStatus::Retrying
            }
        } else if self.run_at > now {
            JobStatus::Scheduled
        } else {
            JobStatus::Waiting
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }
}

/// Build a job id from a content hash of `(job_type, payload)` plus a
/// millisecond timestamp.
pub fn make_job_id(job_type: &str, payload: &serde_json::Value, at_ms: i64) -> JobId {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();

    format!("{job_type}:{}:{at_ms}", hex::encode(&digest[..8]))
}

/// Ordered-set score for an eligible job: earlier is better, and each unit of
/// priority is worth `weight_ms` of seniority.
pub(crate) fn waiting_score(eligible_ms: i64, priority: i32, weight_ms: i64) -> i64 {
    eligible_ms.saturating_sub(i64::from(priority).saturating_mul(weight_ms))
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant { ms: u64 },
    /// `base_ms * multiplier^(attempt - 1)`
    Exponential { base_ms: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next attempt, given the number of attempts made so
    /// far (1 after the first failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { ms } => Duration::from_millis(*ms),
            Self::Exponential {
                base_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                // float-to-int casts saturate, so huge exponents clamp to u64::MAX
                let ms = (*base_ms as f64 * multiplier.powi(exponent)) as u64;
                Duration::from_millis(ms)
            }
        }
    }
}
