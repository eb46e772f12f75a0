//! The row mutations accepted by the write path and the outcomes reported for them.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use rowbatch_id::GroupId;
use serde::{Deserialize, Serialize};

/// A single primary key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimaryKeyValue {
    String(String),
    Integer(i64),
    Binary(Vec<u8>),
}

impl From<&str> for PrimaryKeyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PrimaryKeyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PrimaryKeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<Vec<u8>> for PrimaryKeyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl Display for PrimaryKeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Binary(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub value: PrimaryKeyValue,
}

/// The ordered primary key columns of a row.
///
/// The first column is the partition key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey {
    columns: Vec<PrimaryKeyColumn>,
}

impl PrimaryKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key column.
    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<PrimaryKeyValue>) -> Self {
        self.columns.push(PrimaryKeyColumn {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn columns(&self) -> &[PrimaryKeyColumn] {
        &self.columns
    }

    /// The partition key column, if the key has any columns.
    pub fn partition_key(&self) -> Option<&PrimaryKeyColumn> {
        self.columns.first()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", column.name, column.value)?;
        }
        Ok(())
    }
}

/// The identity of one time series: a measurement, the source that produced it, and its tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSeriesKey {
    measurement: String,
    data_source: String,
    tags: BTreeMap<String, String>,
}

impl TimeSeriesKey {
    pub fn new(measurement: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            data_source: data_source.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The canonical tag string, `["k1=v1","k2=v2"]`, with tags ordered by key.
    pub fn tags_string(&self) -> String {
        let mut out = String::from("[");
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('"');
        }
        out.push(']');
        out
    }
}

impl Display for TimeSeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.measurement,
            self.data_source,
            self.tags_string()
        )
    }
}

/// The key addressing the row a [`RowMutation`] changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKey {
    Primary(PrimaryKey),
    TimeSeries(TimeSeriesKey),
}

impl From<PrimaryKey> for RowKey {
    fn from(value: PrimaryKey) -> Self {
        Self::Primary(value)
    }
}

impl From<TimeSeriesKey> for RowKey {
    fn from(value: TimeSeriesKey) -> Self {
        Self::TimeSeries(value)
    }
}

impl Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary(k) => k.fmt(f),
            Self::TimeSeries(k) => k.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Replace the whole row.
    Put,
    /// Modify the given columns, creating the row if needed.
    Update,
    /// Remove the row.
    Delete,
}

/// The change applied to the addressed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub columns: Vec<Column>,
}

impl RowChange {
    pub fn put() -> Self {
        Self::of(ChangeKind::Put)
    }

    pub fn update() -> Self {
        Self::of(ChangeKind::Update)
    }

    pub fn delete() -> Self {
        Self::of(ChangeKind::Delete)
    }

    fn of(kind: ChangeKind) -> Self {
        Self {
            kind,
            columns: vec![],
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.columns.push(Column {
            name: name.into(),
            value,
        });
        self
    }
}

/// One unit of work: a change to one row of one table.
///
/// Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMutation {
    table: String,
    key: RowKey,
    change: RowChange,
}

impl RowMutation {
    pub fn new(table: impl Into<String>, key: impl Into<RowKey>, change: RowChange) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            change,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn change(&self) -> &RowChange {
        &self.change
    }

    /// Returns `true` if both mutations address the same row of the same table.
    pub fn same_row(&self, other: &Self) -> bool {
        self.table == other.table && self.key == other.key
    }
}

/// Error codes reported for a row, either by the server or by the write path itself.
///
/// Every code has a stable name, used by [`Display`] and [`FromStr`], so that retry code sets
/// can be configured as text. Unknown names parse as [`ErrorCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    InternalServerError,
    Timeout,
    PartitionUnavailable,
    TableNotReady,
    RowOperationConflict,
    ServerBusy,
    ServerUnavailable,
    QuotaExhausted,
    ParameterInvalid,
    ConditionCheckFailed,
    RequestTooLarge,
    InvalidPrimaryKey,
    ColumnCountLimitExceeded,
    RowSizeLimitExceeded,
    /// The request never produced a response (connection refused, reset, ...).
    Network,
    /// The row was malformed and never enqueued.
    InvalidRow,
    /// The row's group was cancelled before the row was sent.
    Cancelled,
    /// The engine shut down before the row was sent.
    ShuttingDown,
    /// The row could not be encoded, or the response for it could not be decoded.
    Codec,
    Other(String),
}

impl ErrorCode {
    /// Every named code, in declaration order.
    pub const NAMED: [Self; 19] = [
        Self::InternalServerError,
        Self::Timeout,
        Self::PartitionUnavailable,
        Self::TableNotReady,
        Self::RowOperationConflict,
        Self::ServerBusy,
        Self::ServerUnavailable,
        Self::QuotaExhausted,
        Self::ParameterInvalid,
        Self::ConditionCheckFailed,
        Self::RequestTooLarge,
        Self::InvalidPrimaryKey,
        Self::ColumnCountLimitExceeded,
        Self::RowSizeLimitExceeded,
        Self::Network,
        Self::InvalidRow,
        Self::Cancelled,
        Self::ShuttingDown,
        Self::Codec,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::InternalServerError => "InternalServerError",
            Self::Timeout => "Timeout",
            Self::PartitionUnavailable => "PartitionUnavailable",
            Self::TableNotReady => "TableNotReady",
            Self::RowOperationConflict => "RowOperationConflict",
            Self::ServerBusy => "ServerBusy",
            Self::ServerUnavailable => "ServerUnavailable",
            Self::QuotaExhausted => "QuotaExhausted",
            Self::ParameterInvalid => "ParameterInvalid",
            Self::ConditionCheckFailed => "ConditionCheckFailed",
            Self::RequestTooLarge => "RequestTooLarge",
            Self::InvalidPrimaryKey => "InvalidPrimaryKey",
            Self::ColumnCountLimitExceeded => "ColumnCountLimitExceeded",
            Self::RowSizeLimitExceeded => "RowSizeLimitExceeded",
            Self::Network => "Network",
            Self::InvalidRow => "InvalidRow",
            Self::Cancelled => "Cancelled",
            Self::ShuttingDown => "ShuttingDown",
            Self::Codec => "Codec",
            Self::Other(name) => name,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(Self::NAMED
            .iter()
            .find(|code| code.as_str() == s)
            .cloned()
            .unwrap_or_else(|| Self::Other(s.to_owned())))
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(code) => code,
            Err(never) => match never {},
        }
    }
}

impl From<ErrorCode> for String {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Other(name) => name,
            named => named.as_str().to_owned(),
        }
    }
}

/// The terminal outcome of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOutcome {
    Success,
    Failed { code: ErrorCode, message: String },
}

impl RowOutcome {
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The failure code, if this row failed.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Success => None,
            Self::Failed { code, .. } => Some(code),
        }
    }
}

/// The aggregate result of a group of rows, yielded once every row has an outcome.
///
/// `outcomes[i]` is the outcome of the `i`-th row passed to the submit call, regardless of the
/// order in which rows were resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_id: GroupId,
    pub total_count: usize,
    pub outcomes: Vec<RowOutcome>,
}

impl GroupResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// The submission index and outcome of every failed row.
    pub fn failed(&self) -> impl Iterator<Item = (usize, &RowOutcome)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_success())
    }

    pub fn is_all_succeeded(&self) -> bool {
        self.outcomes.iter().all(RowOutcome::is_success)
    }
}
