//! A [`Transport`] standing in for a server, failing a random share of rows.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rowbatch_write::{
    ErrorCode, RowOutcome, Transport, TransportError, WireBatch, WireResponse, mock::MockCodec,
};
use serde::Serialize;

/// Codes a simulated server fails rows with. All of them are retried by default.
const TRANSIENT_FAILURES: [ErrorCode; 4] = [
    ErrorCode::ServerBusy,
    ErrorCode::Timeout,
    ErrorCode::PartitionUnavailable,
    ErrorCode::TableNotReady,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct TransportStats {
    pub(crate) calls: u64,
    pub(crate) rows: u64,
    pub(crate) injected_failures: u64,
}

/// Answers batches encoded by [`MockCodec`], failing each row with probability `failure_rate`.
#[derive(Debug)]
pub(crate) struct SimulatedTransport {
    failure_rate: f64,
    latency: Option<Duration>,
    rng: Mutex<StdRng>,
    calls: AtomicU64,
    rows: AtomicU64,
    injected_failures: AtomicU64,
}

impl SimulatedTransport {
    /// `failure_rate` is clamped to `[0, 1]`.
    pub(crate) fn new(failure_rate: f64, latency: Option<Duration>, seed: u64) -> Self {
        Self {
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
            latency,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            injected_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn stats(&self) -> TransportStats {
        TransportStats {
            calls: self.calls.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            injected_failures: self.injected_failures.load(Ordering::Relaxed),
        }
    }

    fn outcomes(&self, rows: usize) -> Vec<RowOutcome> {
        let mut rng = self.rng.lock();
        (0..rows)
            .map(|_| {
                if !rng.gen_bool(self.failure_rate) {
                    return RowOutcome::Success;
                }
                self.injected_failures.fetch_add(1, Ordering::Relaxed);
                let code = TRANSIENT_FAILURES
                    .choose(&mut *rng)
                    .cloned()
                    .unwrap_or(ErrorCode::ServerBusy);
                RowOutcome::failed(code, "simulated failure")
            })
            .collect()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, batch: &WireBatch) -> Result<WireResponse, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let rows = MockCodec::decode_batch(batch)
            .map_err(|e| TransportError::rejected(ErrorCode::ParameterInvalid, e.to_string()))?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows.len() as u64, Ordering::Relaxed);

        Ok(MockCodec::encode_response(&self.outcomes(rows.len())))
    }
}

#[cfg(test)]
mod tests {
    use rowbatch_write::{
        BucketId, Codec, PrimaryKey, RetryPolicy, RowChange, RowMutation, WireBatch,
    };

    use super::*;

    fn batch(n: i64) -> WireBatch {
        let rows = (0..n)
            .map(|k| RowMutation::new("t", PrimaryKey::new().with_column("k", k), RowChange::put()))
            .collect::<Vec<_>>();
        MockCodec::default()
            .encode(BucketId::new(0), &rows.iter().collect::<Vec<_>>())
            .unwrap()
    }

    async fn send(transport: &SimulatedTransport, batch: &WireBatch) -> Vec<RowOutcome> {
        let response = transport.send(batch).await.unwrap();
        MockCodec::default().decode(batch, response).unwrap()
    }

    #[tokio::test]
    async fn test_no_failures() {
        let transport = SimulatedTransport::new(0.0, None, 1);
        let batch = batch(20);

        let outcomes = send(&transport, &batch).await;
        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(RowOutcome::is_success));
        assert_eq!(
            transport.stats(),
            TransportStats {
                calls: 1,
                rows: 20,
                injected_failures: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failures_are_transient() {
        let transport = SimulatedTransport::new(1.0, None, 1);
        let outcomes = send(&transport, &batch(10)).await;

        let policy = RetryPolicy::default();
        for outcome in &outcomes {
            let code = outcome.code().unwrap();
            assert!(policy.is_retryable(code), "{code}");
        }
        assert_eq!(transport.stats().injected_failures, 10);
    }

    #[tokio::test]
    async fn test_out_of_range_rate_is_clamped() {
        let transport = SimulatedTransport::new(7.0, None, 1);
        assert!(send(&transport, &batch(3)).await.iter().all(|o| !o.is_success()));

        let transport = SimulatedTransport::new(f64::NAN, None, 1);
        assert!(send(&transport, &batch(3)).await.iter().all(RowOutcome::is_success));
    }

    #[tokio::test]
    async fn test_garbage_batch_is_rejected() {
        let transport = SimulatedTransport::new(0.0, None, 1);
        let batch = WireBatch {
            bucket: BucketId::new(0),
            row_count: 1,
            payload: "not json".into(),
        };
        let err = transport.send(&batch).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParameterInvalid);
    }
}
