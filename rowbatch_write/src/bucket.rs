//! Bucket workers: one pending queue per bucket, drained into batches that are sent through the
//! [`Transport`] and resolved back into their [`RowGroup`]s.

use std::{
    collections::{BTreeSet, VecDeque},
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use hashbrown::HashSet;
use parking_lot::Mutex;
use rowbatch_id::BucketId;
use rowbatch_shutdown::{ShutdownMode, ShutdownToken};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::{BatchLimits, BucketConfig, RetryBackoff, WriteMode},
    retry::{Disposition, RetryClassifier},
    row::{ErrorCode, RowMutation, RowOutcome},
    row_group::RowGroup,
    wire::{Codec, CodecError, Transport, WireBatch},
};

/// A point-in-time snapshot of one bucket's counters.
///
/// Counters are read without synchronisation and may be mutually inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub bucket: BucketId,
    /// Rows the dispatcher assigned to this bucket.
    pub dispatched_rows: u64,
    /// Rows waiting to be placed in a batch, including rows waiting to be retried.
    pub queued_rows: usize,
    pub in_flight_batches: usize,
    pub batches_sent: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    /// Row retries scheduled, counting each retry of a row once.
    pub rows_retried: u64,
}

#[derive(Debug)]
struct PendingRow {
    row: Arc<RowMutation>,
    group: Arc<RowGroup>,
    slot: usize,
    size: usize,
    retries: u32,
    seq: u64,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct PendingQueue {
    rows: VecDeque<PendingRow>,
    bytes: usize,
    next_seq: u64,
    /// Set once the worker has stopped. Nothing may be enqueued after that.
    closed: bool,
}

impl PendingQueue {
    fn push_back(&mut self, row: PendingRow) {
        self.bytes += row.size;
        self.rows.push_back(row);
    }

    fn push_front(&mut self, row: PendingRow) {
        self.bytes += row.size;
        self.rows.push_front(row);
    }

    fn pop_front(&mut self) -> Option<PendingRow> {
        let row = self.rows.pop_front()?;
        self.bytes -= row.size;
        Some(row)
    }

    fn take_all(&mut self) -> Vec<PendingRow> {
        self.bytes = 0;
        self.rows.drain(..).collect()
    }

    /// Remove the rows of cancelled groups from anywhere in the queue.
    fn take_cancelled(&mut self) -> Vec<PendingRow> {
        if !self.rows.iter().any(|r| r.group.is_cancelled()) {
            return vec![];
        }
        let (cancelled, kept): (Vec<_>, Vec<_>) = self
            .rows
            .drain(..)
            .partition(|r| r.group.is_cancelled());
        self.rows = VecDeque::from(kept);
        self.bytes -= cancelled.iter().map(|r| r.size).sum::<usize>();
        cancelled
    }
}

/// Wakes a bucket worker. Groups hold the signal of every bucket their rows were queued in.
#[derive(Debug, Default)]
pub(crate) struct WorkerSignal {
    notify: Notify,
    /// Set when a group with rows in this bucket was cancelled.
    cancelled: AtomicBool,
}

impl WorkerSignal {
    fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn group_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub(crate) fn take_cancelled(&self) -> bool {
        self.cancelled.swap(false, Ordering::AcqRel)
    }
}

/// Identifies a row by table and key for duplicate detection within a batch.
struct RowIdentity(Arc<RowMutation>);

impl PartialEq for RowIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.0.same_row(&other.0)
    }
}

impl Eq for RowIdentity {}

impl Hash for RowIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.table().hash(state);
        self.0.key().hash(state);
    }
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    batches_sent: AtomicU64,
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    rows_retried: AtomicU64,
}

/// The result of inspecting the queue once.
#[derive(Debug)]
enum QueueState {
    /// Send these rows. May be empty if every candidate row was cancelled.
    Batch(Vec<PendingRow>),
    /// Nothing to send yet. Wake at the deadline, if any, or when notified.
    Wait(Option<Instant>),
    /// The queue is closed and nothing is in flight.
    Closed,
}

/// The queue and execution state of one bucket.
#[derive(Debug)]
pub(crate) struct Bucket {
    id: BucketId,
    config: BucketConfig,
    limits: BatchLimits,
    backoff: RetryBackoff,
    classifier: Arc<RetryClassifier>,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn Transport>,

    queue: Mutex<PendingQueue>,
    /// Wakes the worker: rows were enqueued or cancelled, a batch finished, or a flush was
    /// requested.
    signal: Arc<WorkerSignal>,
    /// One permit per batch allowed in flight.
    batch_slots: Arc<Semaphore>,
    counters: Counters,

    /// Sequence numbers of every row enqueued and not yet resolved.
    unresolved: Mutex<BTreeSet<u64>>,
    resolved: Notify,
    /// Rows with a sequence number below this are sent without waiting for `max_wait`.
    flush_target: AtomicU64,
}

impl Bucket {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: BucketId,
        config: BucketConfig,
        limits: BatchLimits,
        backoff: RetryBackoff,
        max_in_flight_batches: usize,
        classifier: Arc<RetryClassifier>,
        codec: Arc<dyn Codec>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let permits = match config.write_mode {
            WriteMode::Sequential => 1,
            WriteMode::Parallel => max_in_flight_batches,
        };
        Self {
            id,
            config,
            limits,
            backoff,
            classifier,
            codec,
            transport,
            queue: Default::default(),
            signal: Default::default(),
            batch_slots: Arc::new(Semaphore::new(permits)),
            counters: Default::default(),
            unresolved: Default::default(),
            resolved: Notify::new(),
            flush_target: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> BucketId {
        self.id
    }

    pub(crate) fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Queue `row`, the `slot`-th row of `group`.
    ///
    /// If the worker has already stopped the row is resolved as
    /// [`ErrorCode::ShuttingDown`] instead.
    pub(crate) fn enqueue(&self, row: Arc<RowMutation>, group: Arc<RowGroup>, slot: usize) {
        let size = self.codec.encoded_size(&row);

        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            self.count_outcome(false);
            group.resolve_or_panic(
                slot,
                RowOutcome::failed(ErrorCode::ShuttingDown, "write engine is shut down"),
            );
            return;
        }

        group.watch(&self.signal);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        self.unresolved.lock().insert(seq);
        queue.push_back(PendingRow {
            row,
            group,
            slot,
            size,
            retries: 0,
            seq,
            enqueued_at: Instant::now(),
        });
        drop(queue);

        self.signal.wake();
    }

    /// Send every row enqueued before the call without waiting for `max_wait`, and wait until all
    /// of them are resolved.
    pub(crate) async fn flush(&self) {
        let target = self.queue.lock().next_seq;
        self.flush_target.fetch_max(target, Ordering::AcqRel);
        self.signal.wake();

        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = self
                .unresolved
                .lock()
                .first()
                .is_none_or(|&seq| seq >= target);
            if done {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn stats(&self, dispatched_rows: u64) -> BucketStats {
        BucketStats {
            bucket: self.id,
            dispatched_rows,
            queued_rows: self.queue.lock().rows.len(),
            in_flight_batches: self.counters.in_flight.load(Ordering::Relaxed),
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            rows_succeeded: self.counters.rows_succeeded.load(Ordering::Relaxed),
            rows_failed: self.counters.rows_failed.load(Ordering::Relaxed),
            rows_retried: self.counters.rows_retried.load(Ordering::Relaxed),
        }
    }

    /// The worker loop. Returns once shutdown was requested, the queue is empty and no batch is
    /// in flight.
    pub(crate) async fn run(self: Arc<Self>, shutdown: ShutdownToken) {
        info!(bucket = %self.id, mode = ?self.config.write_mode, "bucket worker started");

        loop {
            // In sequential mode this waits for the previous batch to be fully resolved.
            let Some(permit) = self.acquire_slot().await else {
                break;
            };
            let Some(batch) = self.next_batch(&shutdown).await else {
                break;
            };

            self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
            let guard = InFlightGuard {
                bucket: Arc::clone(&self),
                _permit: permit,
            };
            let token = shutdown.clone();
            tokio::spawn(async move {
                guard.bucket.execute(batch, &token).await;
                drop(guard);
            });
        }

        info!(bucket = %self.id, "bucket worker stopped");
    }

    /// Wait for a free batch slot, resolving rows of cancelled groups meanwhile.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                biased;
                permit = Arc::clone(&self.batch_slots).acquire_owned() => return permit.ok(),
                _ = self.signal.notify.notified() => self.resolve_cancelled(),
            }
        }
    }

    fn resolve_cancelled(&self) {
        if !self.signal.take_cancelled() {
            return;
        }
        let cancelled = self.queue.lock().take_cancelled();
        for row in cancelled {
            self.finish(row, cancelled_outcome());
        }
    }

    async fn next_batch(&self, shutdown: &ShutdownToken) -> Option<Vec<PendingRow>> {
        loop {
            let mut dropped = vec![];
            let state = self.poll_queue(shutdown.mode(), &mut dropped);

            for (row, code, message) in dropped {
                self.finish(row, RowOutcome::failed(code, message));
            }

            match state {
                QueueState::Batch(batch) if batch.is_empty() => continue,
                QueueState::Batch(batch) => return Some(batch),
                QueueState::Closed => return None,
                QueueState::Wait(deadline) => {
                    let until_deadline = async {
                        match deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = self.signal.notify.notified() => {}
                        _ = until_deadline => {}
                        _ = shutdown.wait_for_shutdown(), if !shutdown.is_shutdown() => {}
                    }
                }
            }
        }
    }

    /// Inspect the queue under its lock. Rows that must be failed without being sent are pushed
    /// to `dropped` so they can be resolved once the lock is released.
    fn poll_queue(
        &self,
        mode: Option<ShutdownMode>,
        dropped: &mut Vec<(PendingRow, ErrorCode, &'static str)>,
    ) -> QueueState {
        let mut queue = self.queue.lock();

        if self.signal.take_cancelled() {
            dropped.extend(
                queue
                    .take_cancelled()
                    .into_iter()
                    .map(|row| (row, ErrorCode::Cancelled, CANCELLED_MESSAGE)),
            );
        }

        if mode == Some(ShutdownMode::Abort) {
            dropped.extend(
                queue
                    .take_all()
                    .into_iter()
                    .map(|row| (row, ErrorCode::ShuttingDown, "write engine aborted")),
            );
        }

        let Some(front) = queue.rows.front() else {
            if mode.is_none() {
                return QueueState::Wait(None);
            }
            if self.counters.in_flight.load(Ordering::Acquire) > 0 {
                // Retried rows of an in-flight batch may still come back.
                return QueueState::Wait(None);
            }
            queue.closed = true;
            return QueueState::Closed;
        };

        let deadline = front.enqueued_at + self.limits.max_wait;
        let ready = mode.is_some()
            || queue.rows.len() >= self.limits.max_rows
            || queue.bytes >= self.limits.max_bytes
            || deadline <= Instant::now()
            || front.seq < self.flush_target.load(Ordering::Acquire);
        if !ready {
            return QueueState::Wait(Some(deadline));
        }

        let mut batch = Vec::new();
        let mut bytes = 0;
        let mut keys = HashSet::new();
        while let Some(row) = queue.pop_front() {
            if row.group.is_cancelled() {
                dropped.push((row, ErrorCode::Cancelled, CANCELLED_MESSAGE));
                continue;
            }

            let full = batch.len() >= self.limits.max_rows
                || (!batch.is_empty() && bytes + row.size > self.limits.max_bytes);
            // A duplicate closes the batch and heads the next one.
            if full
                || (!self.config.allow_duplicate_rows
                    && !keys.insert(RowIdentity(Arc::clone(&row.row))))
            {
                queue.push_front(row);
                break;
            }
            if !row.group.try_mark_sent() {
                dropped.push((row, ErrorCode::Cancelled, CANCELLED_MESSAGE));
                continue;
            }

            bytes += row.size;
            batch.push(row);
        }

        QueueState::Batch(batch)
    }

    /// Send one batch and resolve or requeue each of its rows.
    async fn execute(&self, batch: Vec<PendingRow>, shutdown: &ShutdownToken) {
        self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);

        let wire = match self.encode(&batch) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(bucket = %self.id, rows = batch.len(), error = %e, "failed to encode batch");
                let message = e.to_string();
                for row in batch {
                    self.finish(row, RowOutcome::failed(ErrorCode::Codec, message.clone()));
                }
                return;
            }
        };

        debug!(
            bucket = %self.id,
            rows = batch.len(),
            bytes = wire.payload.len(),
            "sending batch"
        );

        let outcomes = match self.transport.send(&wire).await {
            Ok(response) => match self.codec.decode(&wire, response) {
                Ok(outcomes) if outcomes.len() == batch.len() => outcomes,
                Ok(outcomes) => {
                    let e = CodecError::RowCountMismatch {
                        expected: batch.len(),
                        actual: outcomes.len(),
                    };
                    warn!(bucket = %self.id, error = %e, "unusable batch response");
                    vec![RowOutcome::failed(ErrorCode::Codec, e.to_string()); batch.len()]
                }
                Err(e) => {
                    warn!(bucket = %self.id, error = %e, "unusable batch response");
                    vec![RowOutcome::failed(ErrorCode::Codec, e.to_string()); batch.len()]
                }
            },
            Err(e) => {
                warn!(bucket = %self.id, rows = batch.len(), error = %e, "batch transport failed");
                vec![RowOutcome::failed(e.code(), e.to_string()); batch.len()]
            }
        };

        let mut retry = Vec::new();
        let mut delay = Duration::ZERO;
        for (mut row, outcome) in batch.into_iter().zip(outcomes) {
            let code = match &outcome {
                RowOutcome::Success => {
                    self.finish(row, outcome);
                    continue;
                }
                RowOutcome::Failed { code, .. } => code,
            };

            match self.classifier.classify(code, row.retries) {
                Disposition::Retry => {
                    row.retries += 1;
                    delay = delay.max(self.backoff.delay(row.retries));
                    retry.push(row);
                }
                Disposition::FailPermanently => {
                    if row.retries > 0 && self.classifier.policy().is_retryable(code) {
                        warn!(
                            bucket = %self.id,
                            retries = row.retries,
                            %code,
                            "row exhausted its retries"
                        );
                    }
                    self.finish(row, outcome);
                }
            }
        }

        if retry.is_empty() {
            return;
        }

        self.counters
            .rows_retried
            .fetch_add(retry.len() as u64, Ordering::Relaxed);
        warn!(bucket = %self.id, rows = retry.len(), ?delay, "retrying rows");

        // The batch keeps its slot while backing off, so nothing overtakes the retried rows in
        // sequential mode.
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.requeue(retry),
            _ = shutdown.wait_for_abort() => {
                for row in retry {
                    self.finish(row, RowOutcome::failed(ErrorCode::ShuttingDown, "write engine aborted"));
                }
            }
        }
    }

    fn encode(&self, batch: &[PendingRow]) -> Result<WireBatch, CodecError> {
        let rows = batch.iter().map(|r| r.row.as_ref()).collect::<Vec<_>>();
        self.codec.encode(self.id, &rows)
    }

    /// Put retried rows back at the head of the queue, keeping their relative order.
    fn requeue(&self, rows: Vec<PendingRow>) {
        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            for row in rows {
                self.finish(
                    row,
                    RowOutcome::failed(ErrorCode::ShuttingDown, "write engine is shut down"),
                );
            }
            return;
        }
        for row in rows.into_iter().rev() {
            queue.push_front(row);
        }
        drop(queue);

        self.signal.wake();
    }

    /// Report the terminal `outcome` of `row` to its group.
    fn finish(&self, row: PendingRow, outcome: RowOutcome) {
        self.count_outcome(outcome.is_success());
        row.group.resolve_or_panic(row.slot, outcome);

        self.unresolved.lock().remove(&row.seq);
        self.resolved.notify_waiters();
    }

    fn count_outcome(&self, success: bool) {
        let counter = if success {
            &self.counters.rows_succeeded
        } else {
            &self.counters.rows_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

const CANCELLED_MESSAGE: &str = "group was cancelled";

fn cancelled_outcome() -> RowOutcome {
    RowOutcome::failed(ErrorCode::Cancelled, CANCELLED_MESSAGE)
}

/// Held for the lifetime of an in-flight batch.
#[derive(Debug)]
struct InFlightGuard {
    bucket: Arc<Bucket>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.bucket.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.bucket.signal.wake();
    }
}
