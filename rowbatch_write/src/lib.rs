//! A client-side batched write path.
//!
//! Callers [`submit`](WriteEngine::submit) groups of [`RowMutation`]s to a [`WriteEngine`]. Each
//! row is assigned to a bucket by the [`Dispatcher`], and each bucket's worker drains its queue
//! into batches bounded by row count, encoded size and wait time. Batches are encoded by a
//! [`Codec`] and sent through a [`Transport`]; failed rows are retried or failed according to the
//! [`RetryClassifier`]. Once every row of a group has an outcome its [`GroupFuture`] resolves to
//! a [`GroupResult`] listing the outcomes in submission order.
//!
//! Buckets run in one of two [`WriteMode`]s. In [`WriteMode::Sequential`] a bucket has at most
//! one batch in flight, so rows sharing a hashed key are written in submission order. In
//! [`WriteMode::Parallel`] a bucket has up to
//! [`max_in_flight_batches`](WriteEngineConfig::max_in_flight_batches) batches in flight with no
//! ordering between them.

mod bucket;
pub mod config;
pub mod dispatch;
mod engine;
pub mod mock;
pub mod retry;
pub mod row;
pub mod row_group;
pub mod wire;

pub use bucket::BucketStats;
pub use config::{
    BatchLimits, BucketConfig, ConfigError, DispatchPolicy, RetryBackoff, RetryConfig,
    WriteEngineConfig, WriteMode,
};
pub use dispatch::{DispatchError, Dispatcher};
pub use engine::{EngineStats, WriteEngine};
pub use retry::{Disposition, RetryClassifier, RetryPolicy};
pub use row::{
    ChangeKind, Column, ColumnValue, ErrorCode, GroupResult, PrimaryKey, PrimaryKeyValue,
    RowChange, RowKey, RowMutation, RowOutcome, TimeSeriesKey,
};
pub use row_group::{GroupAbandoned, GroupFuture, RowGroup, RowGroupError};
pub use rowbatch_id::{BucketId, GroupId};
pub use wire::{
    Codec, CodecError, Transport, TransportError, TransportErrorKind, WireBatch, WireResponse,
};
