//! Assignment of rows to buckets.

use std::{
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use rowbatch_id::BucketId;
use thiserror::Error;
use twox_hash::{XxHash3_128, XxHash64};

use crate::{
    config::DispatchPolicy,
    row::{PrimaryKeyColumn, RowKey, RowMutation, TimeSeriesKey},
};

/// A static seed so that every process maps the same key to the same bucket.
const KEY_HASH_SEED: u64 = 0x6d83_9352_a37c_e602;

/// The size of the slot space time-series digests are spread over.
const TIME_SERIES_SLOTS: usize = 256;

/// A row that cannot be dispatched. It is failed immediately and never enqueued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("row has no table")]
    MissingTable,

    #[error("row for table {table:?} has an empty primary key")]
    EmptyPrimaryKey { table: String },

    #[error("time series row for table {table:?} has no measurement")]
    MissingMeasurement { table: String },
}

/// Maps each row to a bucket in `[0, bucket_count)`.
///
/// Hash-based policies are deterministic for a fixed bucket count, so rows sharing a key always
/// share a bucket. Rows keyed by a [`TimeSeriesKey`] are mapped from a digest of the series
/// identity under both hash policies.
#[derive(Debug)]
pub struct Dispatcher {
    policy: DispatchPolicy,
    bucket_count: usize,
    next: AtomicUsize,
    dispatched: Box<[AtomicU64]>,
}

impl Dispatcher {
    /// # Panics
    ///
    /// Panics if `bucket_count` is 0.
    pub fn new(policy: DispatchPolicy, bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "dispatcher needs at least one bucket");
        Self {
            policy,
            bucket_count,
            next: AtomicUsize::new(0),
            dispatched: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Assign `row` to a bucket, counting the assignment.
    pub fn assign(&self, row: &RowMutation) -> Result<BucketId, DispatchError> {
        validate(row)?;

        let index = if self.bucket_count == 1 {
            0
        } else {
            match (self.policy, row.key()) {
                (DispatchPolicy::RoundRobin, _) => {
                    self.next.fetch_add(1, Ordering::Relaxed) % self.bucket_count
                }
                (_, RowKey::TimeSeries(key)) => time_series_bucket(key, self.bucket_count),
                (DispatchPolicy::HashPartitionKey, RowKey::Primary(key)) => {
                    hash_bucket(row.table(), &key.columns()[..1], self.bucket_count)
                }
                (DispatchPolicy::HashPrimaryKey, RowKey::Primary(key)) => {
                    hash_bucket(row.table(), key.columns(), self.bucket_count)
                }
            }
        };

        self.dispatched[index].fetch_add(1, Ordering::Relaxed);
        Ok(BucketId::new(index))
    }

    /// The number of rows assigned to `bucket` so far.
    pub fn dispatched(&self, bucket: BucketId) -> u64 {
        self.dispatched
            .get(bucket.get())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or_default()
    }
}

fn validate(row: &RowMutation) -> Result<(), DispatchError> {
    if row.table().is_empty() {
        return Err(DispatchError::MissingTable);
    }
    match row.key() {
        RowKey::Primary(key) if key.is_empty() => Err(DispatchError::EmptyPrimaryKey {
            table: row.table().to_owned(),
        }),
        RowKey::TimeSeries(key) if key.measurement().is_empty() => {
            Err(DispatchError::MissingMeasurement {
                table: row.table().to_owned(),
            })
        }
        _ => Ok(()),
    }
}

// The derived hash impl is hardened against prefix collisions between fields.
#[derive(Hash)]
struct HashKey<'a> {
    table: &'a str,
    columns: &'a [PrimaryKeyColumn],
}

fn hash_bucket(table: &str, columns: &[PrimaryKeyColumn], bucket_count: usize) -> usize {
    let mut hasher = XxHash64::with_seed(KEY_HASH_SEED);
    HashKey { table, columns }.hash(&mut hasher);
    (hasher.finish() % bucket_count as u64) as usize
}

/// Map a time series to one of `bucket_count` buckets.
///
/// The leading byte of the XXH3-128 digest of the series identity is re-centred from its signed
/// range into `[0, 256)`, and the 256 slots are split into `bucket_count` equal spans. When 256
/// is not a multiple of `bucket_count` the trailing remainder slots wrap around to the first
/// buckets. Bucket counts above 256 are capped to 256.
pub fn time_series_bucket(key: &TimeSeriesKey, bucket_count: usize) -> usize {
    let bucket_count = bucket_count.min(TIME_SERIES_SLOTS);
    if bucket_count <= 1 {
        return 0;
    }
    span_bucket(leading_digest_byte(key), bucket_count)
}

fn leading_digest_byte(key: &TimeSeriesKey) -> i8 {
    let tags = key.tags_string();
    let mut identity =
        Vec::with_capacity(key.measurement().len() + key.data_source().len() + tags.len());
    identity.extend_from_slice(key.measurement().as_bytes());
    identity.extend_from_slice(key.data_source().as_bytes());
    identity.extend_from_slice(tags.as_bytes());

    XxHash3_128::oneshot(&identity).to_be_bytes()[0] as i8
}

fn span_bucket(leading: i8, bucket_count: usize) -> usize {
    let bucket_count = bucket_count as i32;
    let centered = i32::from(leading) + 128;
    let span = TIME_SERIES_SLOTS as i32 / bucket_count;
    ((centered / span + bucket_count) % bucket_count) as usize
}
