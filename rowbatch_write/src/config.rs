//! Static configuration of a [`WriteEngine`](crate::WriteEngine).

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("bucket count must be at least 1")]
    ZeroBuckets,

    #[error("max batch rows must be at least 1")]
    ZeroBatchRows,

    #[error("max batch bytes must be at least 1")]
    ZeroBatchBytes,

    #[error("max in-flight batches must be at least 1")]
    ZeroInFlightBatches,

    #[error("bucket override for index {index} is out of range for {bucket_count} buckets")]
    OverrideOutOfRange { index: usize, bucket_count: usize },

    #[error("retry backoff multiplier must be at least 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("invalid bucket config {input:?}: {reason}")]
    InvalidBucketConfig { input: String, reason: String },
}

/// How rows are assigned to buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// Rotate through the buckets, ignoring row content.
    RoundRobin,
    /// Hash the table and the first primary key column.
    HashPartitionKey,
    /// Hash the table and every primary key column.
    #[default]
    HashPrimaryKey,
}

/// How many batches of a single bucket may be in flight at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// One batch at a time. Batches complete in the order they were formed.
    #[default]
    Sequential,
    /// Up to [`WriteEngineConfig::max_in_flight_batches`] batches at a time, with no ordering
    /// between them.
    Parallel,
}

/// Policy of a single bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// When set, only rows of this table are accepted by the bucket.
    pub table: Option<String>,
    pub write_mode: WriteMode,
    /// Allow several mutations of the same row in one batch.
    pub allow_duplicate_rows: bool,
}

impl BucketConfig {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_allow_duplicate_rows(mut self, allow: bool) -> Self {
        self.allow_duplicate_rows = allow;
        self
    }

    /// Returns `true` if rows of `table` may be routed to this bucket.
    pub fn accepts_table(&self, table: &str) -> bool {
        self.table.as_deref().is_none_or(|t| t == table)
    }
}

/// Limits bounding a single batch. Whichever is reached first closes the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    /// The longest the oldest pending row waits before a partial batch is sent.
    pub max_wait: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_rows: 200,
            max_bytes: 4 * 1024 * 1024,
            max_wait: Duration::from_millis(50),
        }
    }
}

/// Exponential backoff between retries of a row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    /// The delay before retry `attempt` (1-based): `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed per row, on top of the first attempt.
    pub max_retries: u32,
    pub backoff: RetryBackoff,
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: RetryBackoff::default(),
            policy: RetryPolicy::default(),
        }
    }
}

/// Configuration of a [`WriteEngine`](crate::WriteEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEngineConfig {
    pub bucket_count: usize,
    pub dispatch: DispatchPolicy,
    /// Policy of every bucket without an entry in `bucket_overrides`.
    pub default_bucket: BucketConfig,
    pub bucket_overrides: BTreeMap<usize, BucketConfig>,
    pub batch: BatchLimits,
    pub retry: RetryConfig,
    /// Concurrency bound of a bucket in [`WriteMode::Parallel`].
    pub max_in_flight_batches: usize,
}

impl Default for WriteEngineConfig {
    fn default() -> Self {
        Self {
            bucket_count: 8,
            dispatch: DispatchPolicy::default(),
            default_bucket: BucketConfig::default(),
            bucket_overrides: BTreeMap::new(),
            batch: BatchLimits::default(),
            retry: RetryConfig::default(),
            max_in_flight_batches: 10,
        }
    }
}

impl WriteEngineConfig {
    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Set the write mode of every bucket without an override.
    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.default_bucket.write_mode = write_mode;
        self
    }

    pub fn with_default_bucket(mut self, config: BucketConfig) -> Self {
        self.default_bucket = config;
        self
    }

    pub fn with_bucket_override(mut self, index: usize, config: BucketConfig) -> Self {
        self.bucket_overrides.insert(index, config);
        self
    }

    pub fn with_max_batch_rows(mut self, max_rows: usize) -> Self {
        self.batch.max_rows = max_rows;
        self
    }

    pub fn with_max_batch_bytes(mut self, max_bytes: usize) -> Self {
        self.batch.max_bytes = max_bytes;
        self
    }

    pub fn with_max_batch_wait(mut self, max_wait: Duration) -> Self {
        self.batch.max_wait = max_wait;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry.policy = policy;
        self
    }

    pub fn with_max_in_flight_batches(mut self, max: usize) -> Self {
        self.max_in_flight_batches = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_count == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if self.batch.max_rows == 0 {
            return Err(ConfigError::ZeroBatchRows);
        }
        if self.batch.max_bytes == 0 {
            return Err(ConfigError::ZeroBatchBytes);
        }
        if self.max_in_flight_batches == 0 {
            return Err(ConfigError::ZeroInFlightBatches);
        }
        if let Some(&index) = self
            .bucket_overrides
            .keys()
            .find(|&&i| i >= self.bucket_count)
        {
            return Err(ConfigError::OverrideOutOfRange {
                index,
                bucket_count: self.bucket_count,
            });
        }
        let multiplier = self.retry.backoff.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(multiplier));
        }
        Ok(())
    }

    /// The effective policy of bucket `index`.
    pub fn bucket_config(&self, index: usize) -> &BucketConfig {
        self.bucket_overrides
            .get(&index)
            .unwrap_or(&self.default_bucket)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = WriteEngineConfig::default();
        assert_eq!(config.bucket_count, 8);
        assert_eq!(config.dispatch, DispatchPolicy::HashPrimaryKey);
        assert_eq!(config.default_bucket.write_mode, WriteMode::Sequential);
        assert!(!config.default_bucket.allow_duplicate_rows);
        assert_eq!(config.batch.max_rows, 200);
        assert_eq!(config.batch.max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.batch.max_wait, Duration::from_millis(50));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.policy, RetryPolicy::allow_list());
        assert_eq!(config.max_in_flight_batches, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let base = WriteEngineConfig::default();

        assert_matches!(
            base.clone().with_bucket_count(0).validate(),
            Err(ConfigError::ZeroBuckets)
        );
        assert_matches!(
            base.clone().with_max_batch_rows(0).validate(),
            Err(ConfigError::ZeroBatchRows)
        );
        assert_matches!(
            base.clone().with_max_batch_bytes(0).validate(),
            Err(ConfigError::ZeroBatchBytes)
        );
        assert_matches!(
            base.clone().with_max_in_flight_batches(0).validate(),
            Err(ConfigError::ZeroInFlightBatches)
        );
        assert_matches!(
            base.clone()
                .with_bucket_count(4)
                .with_bucket_override(4, BucketConfig::default())
                .validate(),
            Err(ConfigError::OverrideOutOfRange {
                index: 4,
                bucket_count: 4
            })
        );
        assert_matches!(
            base.clone()
                .with_retry_backoff(RetryBackoff {
                    multiplier: 0.5,
                    ..Default::default()
                })
                .validate(),
            Err(ConfigError::InvalidBackoffMultiplier(_))
        );
        assert_matches!(
            base.with_retry_backoff(RetryBackoff {
                multiplier: f64::NAN,
                ..Default::default()
            })
            .validate(),
            Err(ConfigError::InvalidBackoffMultiplier(_))
        );
    }

    #[test]
    fn test_bucket_overrides() {
        let parallel = BucketConfig::default()
            .with_write_mode(WriteMode::Parallel)
            .with_table("bananas");
        let config = WriteEngineConfig::default()
            .with_bucket_count(4)
            .with_bucket_override(2, parallel.clone());

        assert_eq!(config.bucket_config(2), &parallel);
        assert_eq!(config.bucket_config(1), &BucketConfig::default());

        assert!(parallel.accepts_table("bananas"));
        assert!(!parallel.accepts_table("platanos"));
        assert!(BucketConfig::default().accepts_table("platanos"));
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = RetryBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            multiplier: 2.0,
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));

        let constant = RetryBackoff {
            multiplier: 1.0,
            ..backoff
        };
        assert_eq!(constant.delay(7), Duration::from_millis(100));
    }
}
