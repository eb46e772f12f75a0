//! The collaborators that put batches on the wire.
//!
//! The write path treats encoded batches and responses as opaque bytes. A [`Codec`] turns rows
//! into a [`WireBatch`] and a [`WireResponse`] back into per-row outcomes, and a [`Transport`]
//! moves a batch to the server and returns a single attempt's response.

use std::fmt::Display;

use async_trait::async_trait;
use bytes::Bytes;
use rowbatch_id::BucketId;
use thiserror::Error;

use crate::row::{ErrorCode, RowMutation, RowOutcome};

/// An encoded batch of rows destined for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBatch {
    pub bucket: BucketId,
    /// The number of rows encoded in `payload`, in batch order.
    pub row_count: usize,
    pub payload: Bytes,
}

/// The encoded server response to one [`WireBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub payload: Bytes,
}

impl WireResponse {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode batch: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("response carries {actual} row statuses for a batch of {expected} rows")]
    RowCountMismatch { expected: usize, actual: usize },
}

/// Why a single transport attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionRefused,
    /// No response arrived in time.
    Timeout,
    Io,
    /// The server rejected the whole request without per-row statuses.
    Rejected(ErrorCode),
}

impl Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRefused => f.write_str("connection refused"),
            Self::Timeout => f.write_str("timeout"),
            Self::Io => f.write_str("i/o"),
            Self::Rejected(code) => write!(f, "rejected ({code})"),
        }
    }
}

/// A failed transport attempt. No per-row status is available.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionRefused, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected(code), message)
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The code every row of the failed batch is classified with.
    pub fn code(&self) -> ErrorCode {
        match &self.kind {
            TransportErrorKind::ConnectionRefused | TransportErrorKind::Io => ErrorCode::Network,
            TransportErrorKind::Timeout => ErrorCode::Timeout,
            TransportErrorKind::Rejected(code) => code.clone(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, e.to_string())
    }
}

/// Serialises rows into wire batches and decodes the server's per-row statuses.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// The serialised size of `row`, used to bound batches by byte size.
    fn encoded_size(&self, row: &RowMutation) -> usize;

    /// Encode `rows`, in order, into one batch for `bucket`.
    fn encode(&self, bucket: BucketId, rows: &[&RowMutation]) -> Result<WireBatch, CodecError>;

    /// Decode `response` into one outcome per row of `batch`, in batch order.
    fn decode(&self, batch: &WireBatch, response: WireResponse)
    -> Result<Vec<RowOutcome>, CodecError>;
}

/// An abstract client that pushes a [`WireBatch`] to the server.
///
/// Implementations may retry at the connection level, but return the outcome of a single
/// logical attempt.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send `batch` and wait for the response.
    async fn send(&self, batch: &WireBatch) -> Result<WireResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_codes() {
        assert_eq!(
            TransportError::connection_refused("nope").code(),
            ErrorCode::Network
        );
        assert_eq!(TransportError::timeout("slow").code(), ErrorCode::Timeout);
        assert_eq!(
            TransportError::rejected(ErrorCode::RequestTooLarge, "big").code(),
            ErrorCode::RequestTooLarge
        );

        let e = TransportError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(e.kind(), &TransportErrorKind::Io);
        assert_eq!(e.code(), ErrorCode::Network);

        let e = TransportError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(e.code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_transport_error_display() {
        let e = TransportError::rejected(ErrorCode::ServerBusy, "try later");
        assert_eq!(
            e.to_string(),
            "transport error (rejected (ServerBusy)): try later"
        );
    }
}
