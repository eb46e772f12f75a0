//! Identifiers used on the rowbatch write path.
//!
//! Unlike process-global id counters, a [`GroupIdGenerator`] is owned by a single write engine,
//! so several engines running in one process never share an id space.
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies a group of rows submitted together by one caller.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct GroupId(u64);

impl GroupId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for GroupId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing [`GroupId`]s.
#[derive(Debug, Default)]
pub struct GroupIdGenerator {
    next: AtomicU64,
}

impl GroupIdGenerator {
    /// Create a generator whose first id is `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a generator whose first id is `first`.
    pub fn starting_at(first: GroupId) -> Self {
        Self {
            next: AtomicU64::new(first.0),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> GroupId {
        GroupId(
            self.next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .expect("Overflowed with group IDs"),
        )
    }

    /// The id the next call to [`next_id`][Self::next_id] will return.
    pub fn peek(&self) -> GroupId {
        GroupId(self.next.load(Ordering::SeqCst))
    }
}

/// Index of a bucket within a write engine, always in `[0, bucket_count)`.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct BucketId(u32);

impl BucketId {
    /// # Panics
    ///
    /// Panics if `index` does not fit in a `u32`.
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("bucket index overflows u32"))
    }

    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for BucketId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
