//! Aggregation of group results into the summary printed at the end of a run.

use std::{collections::BTreeMap, time::Duration};

use parking_lot::Mutex;
use rowbatch_write::{EngineStats, GroupResult};
use serde::Serialize;

use crate::simulated::TransportStats;

/// Number of latency buckets. Bucket `i` holds samples of at most `2^i` microseconds; the last
/// one is unbounded.
const LATENCY_BUCKETS: usize = 40;

/// Group latencies counted in exponentially sized buckets, so a run of any length records them
/// in fixed memory.
#[derive(Debug)]
struct LatencyHistogram {
    counts: [u64; LATENCY_BUCKETS],
    max: Option<Duration>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: [0; LATENCY_BUCKETS],
            max: None,
        }
    }
}

impl LatencyHistogram {
    fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let bucket = match micros {
            0 | 1 => 0,
            n => (u64::BITS - (n - 1).leading_zeros()) as usize,
        };
        self.counts[bucket.min(LATENCY_BUCKETS - 1)] += 1;
        self.max = self.max.max(Some(latency));
    }

    /// The upper bound of the bucket holding the `p`-th percentile sample, capped at the largest
    /// sample seen.
    fn percentile(&self, p: u64) -> Option<Duration> {
        let max = self.max?;
        let total: u64 = self.counts.iter().sum();
        let target = total.saturating_mul(p).div_ceil(100).max(1);

        let mut seen = 0;
        for (bucket, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                if bucket == LATENCY_BUCKETS - 1 {
                    return Some(max);
                }
                return Some(Duration::from_micros(1 << bucket).min(max));
            }
        }
        Some(max)
    }
}

#[derive(Debug, Default)]
struct State {
    groups: u64,
    rows: u64,
    rows_succeeded: u64,
    failures_by_code: BTreeMap<String, u64>,
    latencies: LatencyHistogram,
}

/// Collects the results of completed groups from any number of submitters.
#[derive(Debug, Default)]
pub(crate) struct GroupReporter {
    state: Mutex<State>,
}

impl GroupReporter {
    pub(crate) fn record(&self, result: &GroupResult, latency: Duration) {
        let mut state = self.state.lock();
        state.groups += 1;
        state.rows += result.total_count as u64;
        state.rows_succeeded += result.succeeded() as u64;
        for (_, outcome) in result.failed() {
            if let Some(code) = outcome.code() {
                *state.failures_by_code.entry(code.to_string()).or_default() += 1;
            }
        }
        state.latencies.record(latency);
    }

    pub(crate) fn summary(
        &self,
        elapsed: Duration,
        engine: EngineStats,
        transport: TransportStats,
    ) -> Summary {
        let state = self.state.lock();
        let secs = elapsed.as_secs_f64();

        Summary {
            elapsed_ms: millis(elapsed),
            groups: state.groups,
            rows: state.rows,
            rows_succeeded: state.rows_succeeded,
            rows_failed: state.rows - state.rows_succeeded,
            rows_per_sec: if secs > 0.0 {
                state.rows as f64 / secs
            } else {
                0.0
            },
            failures_by_code: state.failures_by_code.clone(),
            group_latency_ms: LatencySummary {
                p50: state.latencies.percentile(50).map(millis),
                p99: state.latencies.percentile(99).map(millis),
                max: state.latencies.max.map(millis),
            },
            transport,
            engine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct LatencySummary {
    pub(crate) p50: Option<f64>,
    pub(crate) p99: Option<f64>,
    pub(crate) max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Summary {
    pub(crate) elapsed_ms: f64,
    pub(crate) groups: u64,
    pub(crate) rows: u64,
    pub(crate) rows_succeeded: u64,
    pub(crate) rows_failed: u64,
    pub(crate) rows_per_sec: f64,
    pub(crate) failures_by_code: BTreeMap<String, u64>,
    pub(crate) group_latency_ms: LatencySummary,
    pub(crate) transport: TransportStats,
    pub(crate) engine: EngineStats,
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rowbatch_write::{ErrorCode, GroupId, RowOutcome};

    use super::*;

    fn result(outcomes: Vec<RowOutcome>) -> GroupResult {
        GroupResult {
            group_id: GroupId::new(0),
            total_count: outcomes.len(),
            outcomes,
        }
    }

    #[test]
    fn test_percentile() {
        let mut histogram = LatencyHistogram::default();
        assert_eq!(histogram.percentile(50), None);

        for ms in 1..=100 {
            histogram.record(Duration::from_millis(ms));
        }
        // The 50th sample, 50ms, lies in the bucket bounded by 2^16us.
        assert_eq!(histogram.percentile(50), Some(Duration::from_micros(65_536)));
        // The bound of the 99th sample's bucket is above the largest sample.
        assert_eq!(histogram.percentile(99), Some(Duration::from_millis(100)));
        assert_eq!(histogram.max, Some(Duration::from_millis(100)));

        let mut histogram = LatencyHistogram::default();
        histogram.record(Duration::from_millis(1));
        assert_eq!(histogram.percentile(99), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_latency_buckets() {
        let mut histogram = LatencyHistogram::default();
        for micros in [0, 1, 2, 3, 4, 5] {
            histogram.record(Duration::from_micros(micros));
        }
        assert_eq!(histogram.counts[..4], [2, 1, 2, 1]);

        // Samples past the last bound land in the last bucket and report the real maximum.
        histogram.record(Duration::MAX);
        assert_eq!(histogram.counts[LATENCY_BUCKETS - 1], 1);
        assert_eq!(histogram.percentile(100), Some(Duration::MAX));
        assert_eq!(histogram.counts.iter().sum::<u64>(), 7);
    }

    #[test]
    fn test_summary() {
        let reporter = GroupReporter::default();
        reporter.record(
            &result(vec![
                RowOutcome::Success,
                RowOutcome::failed(ErrorCode::ServerBusy, "busy"),
                RowOutcome::failed(ErrorCode::ServerBusy, "busy"),
            ]),
            Duration::from_millis(10),
        );
        reporter.record(
            &result(vec![
                RowOutcome::Success,
                RowOutcome::failed(ErrorCode::Timeout, "slow"),
            ]),
            Duration::from_millis(30),
        );

        let summary = reporter.summary(
            Duration::from_secs(2),
            EngineStats { buckets: vec![] },
            TransportStats::default(),
        );

        assert_eq!(summary.groups, 2);
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.rows_succeeded, 2);
        assert_eq!(summary.rows_failed, 3);
        assert_eq!(summary.rows_per_sec, 2.5);
        assert_eq!(
            summary.failures_by_code,
            BTreeMap::from([("ServerBusy".to_owned(), 2), ("Timeout".to_owned(), 1)])
        );
        assert_eq!(summary.group_latency_ms.max, Some(30.0));
        // 10ms lies in the bucket bounded by 2^14us.
        assert_eq!(summary.group_latency_ms.p50, Some(16.384));
    }

    #[test]
    fn test_empty_summary_serializes() {
        let summary = GroupReporter::default().summary(
            Duration::ZERO,
            EngineStats { buckets: vec![] },
            TransportStats::default(),
        );
        assert_eq!(summary.rows_per_sec, 0.0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["group_latency_ms"]["p50"], serde_json::Value::Null);
    }
}
