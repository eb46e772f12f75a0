//! The [`WriteEngine`]: the entry point composing dispatch, buckets and row groups.

use std::sync::Arc;

use rowbatch_id::{BucketId, GroupIdGenerator};
use rowbatch_shutdown::{ShutdownManager, ShutdownMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    bucket::{Bucket, BucketStats},
    config::{ConfigError, WriteEngineConfig},
    dispatch::Dispatcher,
    retry::RetryClassifier,
    row::{ErrorCode, RowMutation, RowOutcome},
    row_group::{GroupFuture, RowGroup},
    wire::{Codec, Transport},
};

/// Counters of every bucket of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub buckets: Vec<BucketStats>,
}

impl EngineStats {
    pub fn dispatched_rows(&self) -> u64 {
        self.buckets.iter().map(|b| b.dispatched_rows).sum()
    }

    pub fn queued_rows(&self) -> usize {
        self.buckets.iter().map(|b| b.queued_rows).sum()
    }

    pub fn batches_sent(&self) -> u64 {
        self.buckets.iter().map(|b| b.batches_sent).sum()
    }

    pub fn rows_succeeded(&self) -> u64 {
        self.buckets.iter().map(|b| b.rows_succeeded).sum()
    }

    pub fn rows_failed(&self) -> u64 {
        self.buckets.iter().map(|b| b.rows_failed).sum()
    }

    pub fn rows_retried(&self) -> u64 {
        self.buckets.iter().map(|b| b.rows_retried).sum()
    }
}

/// Batches, dispatches and retries row mutations on behalf of any number of concurrent callers.
///
/// Each bucket is drained by a background worker spawned on the current tokio runtime when the
/// engine is created. [`submit`](Self::submit) never blocks: it returns a [`GroupFuture`] that
/// resolves once every submitted row has an outcome.
///
/// Dropping the engine without calling [`shutdown`](Self::shutdown) aborts it: queued rows are
/// failed with [`ErrorCode::ShuttingDown`].
#[derive(Debug)]
pub struct WriteEngine {
    config: WriteEngineConfig,
    dispatcher: Dispatcher,
    buckets: Vec<Arc<Bucket>>,
    group_ids: GroupIdGenerator,
    shutdown: ShutdownManager,
}

impl WriteEngine {
    /// Validate `config` and start one worker per bucket.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(
        config: WriteEngineConfig,
        codec: Arc<dyn Codec>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let classifier = Arc::new(RetryClassifier::new(
            config.retry.policy.clone(),
            config.retry.max_retries,
        ));
        let shutdown = ShutdownManager::new();

        let buckets = (0..config.bucket_count)
            .map(|index| {
                let bucket = Arc::new(Bucket::new(
                    BucketId::new(index),
                    config.bucket_config(index).clone(),
                    config.batch,
                    config.retry.backoff,
                    config.max_in_flight_batches,
                    Arc::clone(&classifier),
                    Arc::clone(&codec),
                    Arc::clone(&transport),
                ));
                shutdown.spawn(Arc::clone(&bucket).run(shutdown.register()));
                bucket
            })
            .collect::<Vec<_>>();

        info!(
            buckets = config.bucket_count,
            dispatch = ?config.dispatch,
            max_batch_rows = config.batch.max_rows,
            max_batch_bytes = config.batch.max_bytes,
            max_batch_wait = ?config.batch.max_wait,
            max_retries = config.retry.max_retries,
            "write engine started"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(config.dispatch, config.bucket_count),
            config,
            buckets,
            group_ids: GroupIdGenerator::new(),
            shutdown,
        })
    }

    pub fn config(&self) -> &WriteEngineConfig {
        &self.config
    }

    /// Submit `rows` as one group, returning the future of its [`GroupResult`].
    ///
    /// Malformed rows, and rows routed to a bucket restricted to another table, are failed with
    /// [`ErrorCode::InvalidRow`] without being enqueued. After shutdown every row is failed with
    /// [`ErrorCode::ShuttingDown`].
    ///
    /// [`GroupResult`]: crate::GroupResult
    pub fn submit(&self, rows: impl IntoIterator<Item = RowMutation>) -> GroupFuture {
        let rows = rows.into_iter().collect::<Vec<_>>();
        let (group, fut) = RowGroup::new(self.group_ids.next_id(), rows.len());
        debug!(group_id = %group.id(), rows = rows.len(), "submitting group");

        let shutting_down = self.shutdown.is_shutdown();
        for (slot, row) in rows.into_iter().enumerate() {
            if shutting_down {
                group.resolve_or_panic(
                    slot,
                    RowOutcome::failed(ErrorCode::ShuttingDown, "write engine is shut down"),
                );
                continue;
            }

            let bucket = match self.dispatcher.assign(&row) {
                Ok(id) => &self.buckets[id.get()],
                Err(e) => {
                    debug!(group_id = %group.id(), slot, error = %e, "rejected malformed row");
                    group.resolve_or_panic(
                        slot,
                        RowOutcome::failed(ErrorCode::InvalidRow, e.to_string()),
                    );
                    continue;
                }
            };

            if !bucket.config().accepts_table(row.table()) {
                let message = format!(
                    "bucket {} only accepts rows of table {:?}, got {:?}",
                    bucket.id(),
                    bucket.config().table.as_deref().unwrap_or_default(),
                    row.table()
                );
                group.resolve_or_panic(slot, RowOutcome::failed(ErrorCode::InvalidRow, message));
                continue;
            }

            bucket.enqueue(Arc::new(row), Arc::clone(&group), slot);
        }

        fut
    }

    /// Submit a single row as its own group.
    pub fn submit_row(&self, row: RowMutation) -> GroupFuture {
        self.submit([row])
    }

    /// Send every pending row without waiting for the batch wait time, and wait until every row
    /// submitted before the call has been resolved.
    pub async fn flush(&self) {
        futures::future::join_all(self.buckets.iter().map(|b| b.flush())).await;
    }

    /// Stop accepting rows and wait for every bucket worker to stop.
    ///
    /// With `drain` set, every queued and in-flight row is sent and resolved first. Otherwise
    /// queued rows, including rows waiting to be retried, are failed with
    /// [`ErrorCode::ShuttingDown`] and only in-flight batches complete.
    pub async fn shutdown(&self, drain: bool) {
        let mode = if drain {
            ShutdownMode::Drain
        } else {
            ShutdownMode::Abort
        };
        info!(?mode, "shutting down write engine");
        self.shutdown.shutdown(mode);
        self.shutdown.join().await;
        info!("write engine stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            buckets: self
                .buckets
                .iter()
                .map(|b| b.stats(self.dispatcher.dispatched(b.id())))
                .collect(),
        }
    }
}

impl Drop for WriteEngine {
    fn drop(&mut self) {
        self.shutdown.shutdown(ShutdownMode::Abort);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use rowbatch_id::GroupId;

    use super::*;
    use crate::{
        mock::{MockCodec, MockTransport},
        row::{PrimaryKey, RowChange},
    };

    fn row(key: i64) -> RowMutation {
        RowMutation::new("t", PrimaryKey::new().with_column("k", key), RowChange::put())
    }

    fn engine(config: WriteEngineConfig) -> (WriteEngine, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let engine = WriteEngine::new(
            config,
            Arc::new(MockCodec::default()),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();
        (engine, transport)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = WriteEngine::new(
            WriteEngineConfig::default().with_bucket_count(0),
            Arc::new(MockCodec::default()),
            Arc::new(MockTransport::new()),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::ZeroBuckets);
    }

    #[tokio::test]
    async fn test_group_ids_are_per_engine() {
        let (a, _) = engine(WriteEngineConfig::default());
        let (b, _) = engine(WriteEngineConfig::default());

        assert_eq!(a.submit(vec![]).group_id(), GroupId::new(0));
        assert_eq!(a.submit(vec![]).group_id(), GroupId::new(1));
        assert_eq!(b.submit(vec![]).group_id(), GroupId::new(0));
    }

    #[tokio::test]
    async fn test_empty_submit_completes() {
        let (engine, transport) = engine(WriteEngineConfig::default());
        let result = engine.submit(vec![]).await.unwrap();
        assert_eq!(result.total_count, 0);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ignores_max_wait() {
        let (engine, transport) = engine(
            WriteEngineConfig::default()
                .with_bucket_count(2)
                .with_max_batch_wait(Duration::from_secs(3600)),
        );

        let fut = engine.submit((0..10).map(row));
        let started = tokio::time::Instant::now();
        engine.flush().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(fut.await.unwrap().is_all_succeeded());
        assert!(transport.call_count() >= 1);
        assert_eq!(engine.stats().rows_succeeded(), 10);
    }

    #[tokio::test]
    async fn test_drop_aborts() {
        let (engine, _) =
            engine(WriteEngineConfig::default().with_max_batch_wait(Duration::from_secs(3600)));
        let fut = engine.submit_row(row(1));
        drop(engine);

        let result = fut.await.unwrap();
        assert_matches!(result.outcomes[0].code(), Some(ErrorCode::ShuttingDown));
    }
}
