//! CLI config for the write engine.

use std::{str::FromStr, time::Duration};

use rowbatch_write::{
    BucketConfig, ConfigError, DispatchPolicy, ErrorCode, RetryBackoff, RetryPolicy,
    WriteEngineConfig, WriteMode,
};

/// How rows are assigned to buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchPolicyArg {
    /// Rotate through the buckets.
    RoundRobin,
    /// Hash the table and the first primary key column.
    HashPartitionKey,
    /// Hash the table and the whole primary key.
    #[default]
    HashPrimaryKey,
}

impl From<DispatchPolicyArg> for DispatchPolicy {
    fn from(value: DispatchPolicyArg) -> Self {
        match value {
            DispatchPolicyArg::RoundRobin => Self::RoundRobin,
            DispatchPolicyArg::HashPartitionKey => Self::HashPartitionKey,
            DispatchPolicyArg::HashPrimaryKey => Self::HashPrimaryKey,
        }
    }
}

/// Batch concurrency of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum WriteModeArg {
    /// One batch in flight per bucket.
    #[default]
    Sequential,
    /// Up to `--max-in-flight-batches` batches in flight per bucket.
    Parallel,
}

impl From<WriteModeArg> for WriteMode {
    fn from(value: WriteModeArg) -> Self {
        match value {
            WriteModeArg::Sequential => Self::Sequential,
            WriteModeArg::Parallel => Self::Parallel,
        }
    }
}

/// How `--retry-codes` is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RetryPolicyArg {
    /// Retry only the listed codes.
    #[default]
    AllowList,
    /// Retry every code except the listed ones.
    DenyList,
}

/// Per-bucket settings overriding the defaults of one bucket index.
///
/// Parsed from `<index>:<key>=<value>[,<key>=<value>...]` with the keys `table`, `mode`
/// (`sequential` or `parallel`) and `duplicates` (`true` or `false`), e.g.
/// `3:table=cpu,mode=parallel`. Keys left out keep the default bucket's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketOverride {
    pub index: usize,
    pub table: Option<String>,
    pub write_mode: Option<WriteMode>,
    pub allow_duplicate_rows: Option<bool>,
}

impl BucketOverride {
    /// Apply this override on top of `base`.
    pub fn apply(&self, base: BucketConfig) -> BucketConfig {
        BucketConfig {
            table: self.table.clone().or(base.table),
            write_mode: self.write_mode.unwrap_or(base.write_mode),
            allow_duplicate_rows: self
                .allow_duplicate_rows
                .unwrap_or(base.allow_duplicate_rows),
        }
    }
}

impl FromStr for BucketOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidBucketConfig {
            input: s.to_owned(),
            reason,
        };

        let (index, settings) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <index>:<settings>".to_owned()))?;
        let index = index
            .trim()
            .parse::<usize>()
            .map_err(|e| invalid(format!("bad bucket index: {e}")))?;

        let mut out = Self {
            index,
            ..Default::default()
        };
        for setting in settings.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = setting
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got {setting:?}")))?;
            match key.trim() {
                "table" => out.table = Some(value.trim().to_owned()),
                "mode" => {
                    out.write_mode = Some(match value.trim() {
                        "sequential" => WriteMode::Sequential,
                        "parallel" => WriteMode::Parallel,
                        other => return Err(invalid(format!("unknown write mode {other:?}"))),
                    })
                }
                "duplicates" => {
                    out.allow_duplicate_rows = Some(
                        value
                            .trim()
                            .parse::<bool>()
                            .map_err(|e| invalid(format!("bad duplicates flag: {e}")))?,
                    )
                }
                other => return Err(invalid(format!("unknown setting {other:?}"))),
            }
        }

        Ok(out)
    }
}

/// CLI config for a write engine.
#[derive(Debug, Clone, clap::Parser)]
pub struct WriterConfig {
    /// Number of buckets rows are dispatched to. Each bucket has its own queue and worker.
    #[clap(
        long = "bucket-count",
        env = "ROWBATCH_BUCKET_COUNT",
        default_value = "8",
        action
    )]
    pub bucket_count: usize,

    /// How rows are assigned to buckets.
    ///
    /// Time-series rows are always assigned by the digest of their series under the hash
    /// policies.
    #[clap(
        long = "dispatch-policy",
        env = "ROWBATCH_DISPATCH_POLICY",
        default_value_t = DispatchPolicyArg::default(),
        value_enum,
        action
    )]
    pub dispatch_policy: DispatchPolicyArg,

    /// Default write mode of every bucket.
    #[clap(
        long = "write-mode",
        env = "ROWBATCH_WRITE_MODE",
        default_value_t = WriteModeArg::default(),
        value_enum,
        action
    )]
    pub write_mode: WriteModeArg,

    /// Allow several mutations of the same row in one batch, for every bucket.
    #[clap(long = "allow-duplicate-rows", env = "ROWBATCH_ALLOW_DUPLICATE_ROWS")]
    pub allow_duplicate_rows: bool,

    /// Per-bucket overrides, as `<index>:<key>=<value>,...`. May be repeated.
    ///
    /// Keys are `table`, `mode` and `duplicates`, e.g. `--bucket-config 0:table=cpu,mode=parallel`.
    /// Multiple overrides in the environment variable are separated by `;`.
    #[clap(
        long = "bucket-config",
        env = "ROWBATCH_BUCKET_CONFIG",
        value_delimiter = ';',
        action = clap::ArgAction::Append
    )]
    pub bucket_overrides: Vec<BucketOverride>,

    /// Maximum number of batches in flight per bucket in parallel mode.
    #[clap(
        long = "max-in-flight-batches",
        env = "ROWBATCH_MAX_IN_FLIGHT_BATCHES",
        default_value = "10",
        action
    )]
    pub max_in_flight_batches: usize,

    /// Maximum number of rows in a batch.
    #[clap(
        long = "max-batch-rows",
        env = "ROWBATCH_MAX_BATCH_ROWS",
        default_value = "200",
        action
    )]
    pub max_batch_rows: usize,

    /// Maximum encoded size of a batch, in bytes.
    #[clap(
        long = "max-batch-bytes",
        env = "ROWBATCH_MAX_BATCH_BYTES",
        default_value = "4194304",
        action
    )]
    pub max_batch_bytes: usize,

    /// How long the oldest queued row of a bucket may wait before a partial batch is sent.
    #[clap(
        long = "max-batch-wait",
        env = "ROWBATCH_MAX_BATCH_WAIT",
        default_value = "50ms",
        value_parser = humantime::parse_duration
    )]
    pub max_batch_wait: Duration,

    /// Number of retries of a failed row, on top of its first attempt.
    #[clap(
        long = "max-retries",
        env = "ROWBATCH_MAX_RETRIES",
        default_value = "3",
        action
    )]
    pub max_retries: u32,

    /// Delay before the first retry of a row.
    #[clap(
        long = "retry-initial-backoff",
        env = "ROWBATCH_RETRY_INITIAL_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_initial_backoff: Duration,

    /// Upper bound of the delay between retries.
    #[clap(
        long = "retry-max-backoff",
        env = "ROWBATCH_RETRY_MAX_BACKOFF",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_backoff: Duration,

    /// Factor applied to the retry delay after every attempt. Must be at least 1.0.
    #[clap(
        long = "retry-backoff-multiplier",
        env = "ROWBATCH_RETRY_BACKOFF_MULTIPLIER",
        default_value = "2.0",
        action
    )]
    pub retry_backoff_multiplier: f64,

    /// How `--retry-codes` is interpreted.
    #[clap(
        long = "retry-policy",
        env = "ROWBATCH_RETRY_POLICY",
        default_value_t = RetryPolicyArg::default(),
        value_enum,
        action
    )]
    pub retry_policy: RetryPolicyArg,

    /// Comma separated error code names for the retry policy, e.g. `Timeout,ServerBusy`.
    ///
    /// Defaults to the transient server codes for an allow-list, and to the client error codes
    /// for a deny-list.
    #[clap(
        long = "retry-codes",
        env = "ROWBATCH_RETRY_CODES",
        value_delimiter = ',',
        value_parser = parse_error_code
    )]
    pub retry_codes: Vec<ErrorCode>,
}

fn parse_error_code(s: &str) -> Result<ErrorCode, std::convert::Infallible> {
    s.parse()
}

impl WriterConfig {
    /// The retry policy selected by `--retry-policy` and `--retry-codes`.
    pub fn retry_policy(&self) -> RetryPolicy {
        let codes = self.retry_codes.iter().cloned();
        match (self.retry_policy, self.retry_codes.is_empty()) {
            (RetryPolicyArg::AllowList, true) => RetryPolicy::allow_list(),
            (RetryPolicyArg::AllowList, false) => RetryPolicy::allow_list_with(codes),
            (RetryPolicyArg::DenyList, true) => RetryPolicy::deny_list(),
            (RetryPolicyArg::DenyList, false) => RetryPolicy::deny_list_with(codes),
        }
    }

    /// Build and validate the engine config.
    pub fn engine_config(&self) -> Result<WriteEngineConfig, ConfigError> {
        let default_bucket = BucketConfig::default()
            .with_write_mode(self.write_mode.into())
            .with_allow_duplicate_rows(self.allow_duplicate_rows);

        let config = self.bucket_overrides.iter().fold(
            WriteEngineConfig::default()
                .with_bucket_count(self.bucket_count)
                .with_dispatch(self.dispatch_policy.into())
                .with_default_bucket(default_bucket.clone())
                .with_max_in_flight_batches(self.max_in_flight_batches)
                .with_max_batch_rows(self.max_batch_rows)
                .with_max_batch_bytes(self.max_batch_bytes)
                .with_max_batch_wait(self.max_batch_wait)
                .with_max_retries(self.max_retries)
                .with_retry_backoff(RetryBackoff {
                    initial: self.retry_initial_backoff,
                    max: self.retry_max_backoff,
                    multiplier: self.retry_backoff_multiplier,
                })
                .with_retry_policy(self.retry_policy()),
            |config, o| config.with_bucket_override(o.index, o.apply(default_bucket.clone())),
        );

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, time::Duration};

    use assert_matches::assert_matches;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> WriterConfig {
        WriterConfig::try_parse_from(std::iter::once("rowbatch").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = WriterConfig::parse_from(std::iter::once(OsString::from("rowbatch")));
        assert_eq!(config.engine_config().unwrap(), WriteEngineConfig::default());
    }

    #[test]
    fn test_all_flags() {
        let config = parse(&[
            "--bucket-count",
            "4",
            "--dispatch-policy",
            "round-robin",
            "--write-mode",
            "parallel",
            "--allow-duplicate-rows",
            "--max-in-flight-batches",
            "3",
            "--max-batch-rows",
            "10",
            "--max-batch-bytes",
            "1024",
            "--max-batch-wait",
            "1s",
            "--max-retries",
            "5",
            "--retry-initial-backoff",
            "20ms",
            "--retry-max-backoff",
            "2s",
            "--retry-backoff-multiplier",
            "1.5",
        ])
        .engine_config()
        .unwrap();

        assert_eq!(config.bucket_count, 4);
        assert_eq!(config.dispatch, DispatchPolicy::RoundRobin);
        assert_eq!(config.default_bucket.write_mode, WriteMode::Parallel);
        assert!(config.default_bucket.allow_duplicate_rows);
        assert_eq!(config.max_in_flight_batches, 3);
        assert_eq!(config.batch.max_rows, 10);
        assert_eq!(config.batch.max_bytes, 1024);
        assert_eq!(config.batch.max_wait, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.retry.backoff,
            RetryBackoff {
                initial: Duration::from_millis(20),
                max: Duration::from_secs(2),
                multiplier: 1.5,
            }
        );
    }

    #[test]
    fn test_bucket_overrides() {
        let config = parse(&[
            "--write-mode",
            "parallel",
            "--bucket-config",
            "0:table=cpu,mode=sequential",
            "--bucket-config",
            "2:duplicates=true",
        ])
        .engine_config()
        .unwrap();

        assert_eq!(
            config.bucket_config(0),
            &BucketConfig::default()
                .with_table("cpu")
                .with_write_mode(WriteMode::Sequential)
        );
        assert_eq!(
            config.bucket_config(2),
            &BucketConfig::default()
                .with_write_mode(WriteMode::Parallel)
                .with_allow_duplicate_rows(true)
        );
        assert_eq!(config.bucket_config(1).write_mode, WriteMode::Parallel);
    }

    #[test]
    fn test_bad_bucket_override() {
        for input in [
            "table=cpu",
            "x:table=cpu",
            "1:mode=fast",
            "1:duplicates=maybe",
            "1:colour=red",
            "1:table",
        ] {
            assert_matches!(
                input.parse::<BucketOverride>(),
                Err(ConfigError::InvalidBucketConfig { input: got, .. }) if got == input,
                "{input}"
            );
        }

        assert!(
            WriterConfig::try_parse_from(["rowbatch", "--bucket-config", "1:mode=fast"]).is_err()
        );
    }

    #[test]
    fn test_override_out_of_range() {
        let err = parse(&["--bucket-count", "2", "--bucket-config", "2:mode=parallel"])
            .engine_config()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OverrideOutOfRange {
                index: 2,
                bucket_count: 2
            }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_eq!(
            parse(&["--bucket-count", "0"]).engine_config().unwrap_err(),
            ConfigError::ZeroBuckets
        );
        assert_matches!(
            parse(&["--retry-backoff-multiplier", "0.5"])
                .engine_config()
                .unwrap_err(),
            ConfigError::InvalidBackoffMultiplier(_)
        );
        assert!(WriterConfig::try_parse_from(["rowbatch", "--max-batch-wait", "soon"]).is_err());
    }

    #[test]
    fn test_retry_policy() {
        assert_eq!(parse(&[]).retry_policy(), RetryPolicy::allow_list());
        assert_eq!(
            parse(&["--retry-policy", "deny-list"]).retry_policy(),
            RetryPolicy::deny_list()
        );

        let policy = parse(&["--retry-codes", "Timeout,ServerBusy"]).retry_policy();
        assert_eq!(
            policy,
            RetryPolicy::allow_list_with([ErrorCode::Timeout, ErrorCode::ServerBusy])
        );

        let policy = parse(&["--retry-policy", "deny-list", "--retry-codes", "Timeout"])
            .retry_policy();
        assert!(!policy.is_retryable(&ErrorCode::Timeout));
        assert!(policy.is_retryable(&ErrorCode::ParameterInvalid));
    }
}
