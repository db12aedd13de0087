//! Queue and store configuration.
//!
//! Both structs have sensible defaults and can be loaded from environment
//! variables. Unparsable values fall back to the default with a warning.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::job::BackoffStrategy;

/// Worker loop tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Idle sleep when no job is ready (env: SOUK_POLL_INTERVAL_MS)
    pub poll_interval: Duration,
    /// Pause after the store becomes unreachable (env: SOUK_STORE_COOLDOWN_MS)
    pub store_error_cooldown: Duration,
    /// How long a popped job may stay claimed before it is handed out again.
    /// `None` disables durable claims. (env: SOUK_CLAIM_TIMEOUT_SECS, 0 = off)
    pub claim_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            store_error_cooldown: Duration::from_secs(5),
            claim_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let claim_secs = env_or(
            "SOUK_CLAIM_TIMEOUT_SECS",
            defaults.claim_timeout.map_or(0, |d| d.as_secs()),
        );

        Self {
            poll_interval: Duration::from_millis(env_or(
                "SOUK_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            store_error_cooldown: Duration::from_millis(env_or(
                "SOUK_STORE_COOLDOWN_MS",
                defaults.store_error_cooldown.as_millis() as u64,
            )),
            claim_timeout: (claim_secs > 0).then(|| Duration::from_secs(claim_secs)),
        }
    }
}

/// Dispatch-side configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts allowed when the submitter does not say (env: SOUK_MAX_ATTEMPTS)
    pub default_max_attempts: u32,
    /// Delay between failed attempts (env: SOUK_BACKOFF_BASE_MS sets the base)
    pub backoff: BackoffStrategy,
    /// Milliseconds of seniority granted per priority unit; 0 gives plain
    /// FIFO ordering (env: SOUK_PRIORITY_WEIGHT_MS)
    pub priority_weight_ms: i64,
    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff: BackoffStrategy::default(),
            priority_weight_ms: 1000,
            event_capacity: 256,
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff = match env::var("SOUK_BACKOFF_BASE_MS").ok() {
            Some(_) => BackoffStrategy::Exponential {
                base_ms: env_or("SOUK_BACKOFF_BASE_MS", 1000),
                multiplier: 2.0,
            },
            None => defaults.backoff,
        };

        Self {
            default_max_attempts: env_or("SOUK_MAX_ATTEMPTS", defaults.default_max_attempts),
            backoff,
            priority_weight_ms: env_or("SOUK_PRIORITY_WEIGHT_MS", defaults.priority_weight_ms),
            event_capacity: defaults.event_capacity,
            worker: WorkerConfig::from_env(),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.default_max_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "event_capacity must be at least 1".into(),
            ));
        }
        if self.priority_weight_ms < 0 {
            return Err(QueueError::InvalidConfig(
                "priority_weight_ms cannot be negative".into(),
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }
        if let BackoffStrategy::Exponential { multiplier, .. } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(QueueError::InvalidConfig(format!(
                    "backoff multiplier must be >= 1.0, got {multiplier}"
                )));
            }
        }
        Ok(())
    }
}

/// Backing store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL (env: REDIS_URL)
    pub redis_url: String,
    /// Prepended to every key (env: SOUK_KEY_PREFIX)
    pub key_prefix: String,
    /// Lifetime of `job:{id}` records (env: SOUK_JOB_TTL_SECS)
    pub job_ttl: Duration,
    /// Lifetime of `idempotency:{id}` markers (env: SOUK_IDEMPOTENCY_TTL_SECS)
    pub idempotency_ttl: Duration,
    /// Maximum length of each outcome ledger (env: SOUK_LEDGER_CAP)
    pub ledger_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            job_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency_ttl: Duration::from_secs(60 * 60),
            ledger_cap: 1000,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: env::var("SOUK_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            job_ttl: Duration::from_secs(env_or(
                "SOUK_JOB_TTL_SECS",
                defaults.job_ttl.as_secs(),
            )),
            idempotency_ttl: Duration::from_secs(env_or(
                "SOUK_IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl.as_secs(),
            )),
            ledger_cap: env_or("SOUK_LEDGER_CAP", defaults.ledger_cap),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.ledger_cap == 0 {
            return Err(QueueError::InvalidConfig("ledger_cap must be at least 1".into()));
        }
        if self.job_ttl.as_millis() == 0 || self.idempotency_ttl.as_millis() == 0 {
            return Err(QueueError::InvalidConfig(
                "job_ttl and idempotency_ttl must be at least 1ms".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.claim_timeout, Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());

        let store = StoreConfig::default();
        assert_eq!(store.job_ttl, Duration::from_secs(86_400));
        assert_eq!(store.idempotency_ttl, Duration::from_secs(3_600));
        assert_eq!(store.ledger_cap, 1000);
        assert!(store.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = QueueConfig {
            default_max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(QueueError::InvalidConfig(_))));

        let config = QueueConfig {
            backoff: BackoffStrategy::Exponential {
                base_ms: 10,
                multiplier: 0.5,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let store = StoreConfig {
            ledger_cap: 0,
            ..Default::default()
        };
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back() {
        assert_eq!(env_or("SOUK_TEST_UNSET_VARIABLE", 42u32), 42);
    }
}
