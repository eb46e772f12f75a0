//! Aggregation of per-row outcomes into one completion per submitted group.
//!
//! A [`RowGroup`] is shared by every bucket its rows were dispatched to. Each row is resolved
//! exactly once through [`RowGroup::resolve_row`]; the call that resolves the last row sends the
//! [`GroupResult`] to the caller's [`GroupFuture`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use parking_lot::Mutex;
use rowbatch_id::GroupId;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::error;

use crate::{
    bucket::WorkerSignal,
    row::{GroupResult, RowOutcome},
};

/// Bookkeeping defects. These never describe a row failure; they mean the write path resolved a
/// row it should not have.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RowGroupError {
    #[error("group {group_id} resolved slot {slot} but only has {total} rows")]
    SlotOutOfRange {
        group_id: GroupId,
        slot: usize,
        total: usize,
    },

    #[error("group {group_id} resolved slot {slot} twice")]
    SlotAlreadyResolved { group_id: GroupId, slot: usize },

    #[error("group {group_id} resolved after all {total} rows completed")]
    AlreadyComplete { group_id: GroupId, total: usize },

    #[error("group {group_id} completed with slot {slot} unresolved")]
    SlotUnresolved { group_id: GroupId, slot: usize },

    #[error("group {group_id} completion was already taken")]
    CompletionTaken { group_id: GroupId },
}

/// The state of a group after one of its rows was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Rows are still outstanding.
    Pending { remaining: usize },
    /// This call resolved the last row and completed the group.
    Completed,
}

/// The cancellation state of a group, shared by the group and its caller's [`GroupFuture`].
#[derive(Debug)]
struct CancelState {
    id: GroupId,
    /// [`CANCELLED`] and [`SENT`] bits.
    flags: AtomicU8,
    /// Signals of the buckets holding rows of this group.
    buckets: Mutex<Vec<Arc<WorkerSignal>>>,
}

const CANCELLED: u8 = 1;
const SENT: u8 = 2;

impl CancelState {
    fn cancel(&self) -> bool {
        let previous = self.flags.fetch_or(CANCELLED, Ordering::AcqRel);
        for signal in self.buckets.lock().iter() {
            signal.group_cancelled();
        }
        previous & SENT == 0
    }

    fn is_cancelled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & CANCELLED != 0
    }

    fn try_mark_sent(&self) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & CANCELLED == 0).then_some(flags | SENT)
            })
            .is_ok()
    }

    fn is_sent(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SENT != 0
    }
}

/// The shared completion state of a group of rows submitted together.
///
/// The group owns the sender of its completion. Once every holder of the group is dropped
/// without resolving all rows, the caller's [`GroupFuture`] fails with [`GroupAbandoned`].
#[derive(Debug)]
pub struct RowGroup {
    slots: Box<[OnceLock<RowOutcome>]>,
    remaining: AtomicUsize,
    state: Arc<CancelState>,
    completion: Mutex<Option<oneshot::Sender<GroupResult>>>,
}

impl RowGroup {
    /// Create a group of `total` rows and the future the caller awaits.
    ///
    /// A group with no rows is complete on construction.
    pub fn new(id: GroupId, total: usize) -> (Arc<Self>, GroupFuture) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CancelState {
            id,
            flags: AtomicU8::new(0),
            buckets: Mutex::new(vec![]),
        });
        let group = Arc::new(Self {
            slots: (0..total).map(|_| OnceLock::new()).collect(),
            remaining: AtomicUsize::new(total),
            state: Arc::clone(&state),
            completion: Mutex::new(Some(tx)),
        });

        if total == 0 {
            if let Some(tx) = group.completion.lock().take() {
                // The receiver is still held here.
                let _ = tx.send(GroupResult {
                    group_id: id,
                    total_count: 0,
                    outcomes: vec![],
                });
            }
        }

        (group, GroupFuture { state, rx })
    }

    pub fn id(&self) -> GroupId {
        self.state.id
    }

    pub fn total_count(&self) -> usize {
        self.slots.len()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Record `outcome` for the row at submission index `slot`.
    ///
    /// Safe to call concurrently for distinct slots. The caller that resolves the last row
    /// completes the group. Resolving a slot twice, a slot out of range, or any slot of a
    /// completed group is an error.
    pub fn resolve_row(&self, slot: usize, outcome: RowOutcome) -> Result<Resolution, RowGroupError> {
        let total = self.total_count();
        if self.is_complete() {
            return Err(RowGroupError::AlreadyComplete {
                group_id: self.id(),
                total,
            });
        }

        let cell = self.slots.get(slot).ok_or(RowGroupError::SlotOutOfRange {
            group_id: self.id(),
            slot,
            total,
        })?;
        cell.set(outcome)
            .map_err(|_| RowGroupError::SlotAlreadyResolved {
                group_id: self.id(),
                slot,
            })?;

        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| RowGroupError::AlreadyComplete {
                group_id: self.id(),
                total,
            })?;

        if previous > 1 {
            return Ok(Resolution::Pending {
                remaining: previous - 1,
            });
        }

        self.complete()?;
        Ok(Resolution::Completed)
    }

    fn complete(&self) -> Result<(), RowGroupError> {
        let outcomes = self
            .slots
            .iter()
            .enumerate()
            .map(|(slot, cell)| {
                cell.get().cloned().ok_or(RowGroupError::SlotUnresolved {
                    group_id: self.id(),
                    slot,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tx = self
            .completion
            .lock()
            .take()
            .ok_or(RowGroupError::CompletionTaken { group_id: self.id() })?;

        // The caller may have dropped its future; nobody is left to observe the result then.
        let _ = tx.send(GroupResult {
            group_id: self.id(),
            total_count: outcomes.len(),
            outcomes,
        });
        Ok(())
    }

    /// Resolve a row, treating a bookkeeping error as fatal.
    ///
    /// # Panics
    ///
    /// Panics if [`resolve_row`](Self::resolve_row) returns an error.
    pub fn resolve_or_panic(&self, slot: usize, outcome: RowOutcome) -> Resolution {
        match self.resolve_row(slot, outcome) {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(error = %e, group_id = %self.id(), "row group invariant violated");
                panic!("row group invariant violated: {e}");
            }
        }
    }

    /// Mark the group's rows that are not yet in a batch as cancelled, and wake the buckets
    /// holding them.
    ///
    /// Returns `true` if none of the group's rows had been placed in a batch.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Record that a row of this group is placed in a batch.
    ///
    /// Returns `false`, recording nothing, if the group was cancelled first.
    pub fn try_mark_sent(&self) -> bool {
        self.state.try_mark_sent()
    }

    pub fn is_sent(&self) -> bool {
        self.state.is_sent()
    }

    /// Register the signal of a bucket that holds rows of this group.
    pub(crate) fn watch(&self, signal: &Arc<WorkerSignal>) {
        let mut buckets = self.state.buckets.lock();
        if !buckets.iter().any(|s| Arc::ptr_eq(s, signal)) {
            buckets.push(Arc::clone(signal));
        }
    }
}

/// Returned by a [`GroupFuture`] when its group was dropped without completing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("group {0} was abandoned before every row was resolved")]
pub struct GroupAbandoned(pub GroupId);

/// Resolves to the [`GroupResult`] of a submitted group once every row has an outcome.
#[derive(Debug)]
pub struct GroupFuture {
    state: Arc<CancelState>,
    rx: oneshot::Receiver<GroupResult>,
}

impl GroupFuture {
    pub fn group_id(&self) -> GroupId {
        self.state.id
    }

    /// Cancel the group.
    ///
    /// Rows that have not yet been placed in a batch resolve as
    /// [`ErrorCode::Cancelled`](crate::ErrorCode::Cancelled) right away, without being sent.
    /// Rows already in flight still resolve with their real outcome, and the future still
    /// completes.
    ///
    /// Returns `true` if no batch carrying the group's rows had been sent.
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// The result, if the group has already completed.
    pub fn try_result(&mut self) -> Option<GroupResult> {
        self.rx.try_recv().ok()
    }
}

impl Future for GroupFuture {
    type Output = Result<GroupResult, GroupAbandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.state.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| GroupAbandoned(id)))
    }
}
