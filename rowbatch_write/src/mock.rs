//! In-memory [`Codec`] and [`Transport`] implementations for tests and load generation.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rowbatch_id::BucketId;

use crate::{
    row::{ErrorCode, RowMutation, RowOutcome},
    wire::{Codec, CodecError, Transport, TransportError, WireBatch, WireResponse},
};

/// A [`Codec`] encoding batches as JSON arrays of rows, and responses as JSON arrays of
/// [`RowOutcome`]s.
#[derive(Debug, Clone, Default)]
pub struct MockCodec {
    unencodable_table: Option<String>,
}

impl MockCodec {
    /// Fail to encode any batch containing a row of `table`.
    pub fn with_unencodable_table(mut self, table: impl Into<String>) -> Self {
        self.unencodable_table = Some(table.into());
        self
    }

    /// The rows of a batch encoded by a [`MockCodec`].
    pub fn decode_batch(batch: &WireBatch) -> Result<Vec<RowMutation>, CodecError> {
        serde_json::from_slice(&batch.payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// A response carrying `outcomes`, decodable by a [`MockCodec`].
    pub fn encode_response(outcomes: &[RowOutcome]) -> WireResponse {
        WireResponse::new(serde_json::to_vec(outcomes).unwrap_or_default())
    }
}

impl Codec for MockCodec {
    fn encoded_size(&self, row: &RowMutation) -> usize {
        serde_json::to_vec(row).map(|v| v.len()).unwrap_or_default()
    }

    fn encode(&self, bucket: BucketId, rows: &[&RowMutation]) -> Result<WireBatch, CodecError> {
        if let Some(table) = &self.unencodable_table {
            if rows.iter().any(|r| r.table() == table) {
                return Err(CodecError::Encode(format!("table {table} is not encodable")));
            }
        }

        let payload = serde_json::to_vec(rows).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(WireBatch {
            bucket,
            row_count: rows.len(),
            payload: Bytes::from(payload),
        })
    }

    fn decode(
        &self,
        _batch: &WireBatch,
        response: WireResponse,
    ) -> Result<Vec<RowOutcome>, CodecError> {
        serde_json::from_slice(&response.payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// A scripted reply of a [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed every row, except rows failed by [`MockTransport::fail_key`].
    AllOk,
    /// One status per row, in batch order.
    Rows(Vec<Result<(), ErrorCode>>),
    /// Fail the whole attempt.
    Transport(TransportError),
    /// Return this response as is.
    Raw(WireResponse),
}

#[derive(Debug)]
struct KeyFailure {
    code: ErrorCode,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Vec<String>>,
    replies: VecDeque<MockReply>,
    key_failures: HashMap<String, KeyFailure>,
}

/// A [`Transport`] that answers from a script and records every batch it receives.
///
/// Each call consumes the next scripted [`MockReply`], falling back to [`MockReply::AllOk`] once
/// the script is exhausted. Rows are identified by the display form of their key.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `latency` before replying.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_replies(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.state.lock().replies.extend(replies);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.state.lock().replies.push_back(reply);
    }

    /// Fail the row with `key` with `code` on every [`MockReply::AllOk`] attempt.
    pub fn fail_key(&self, key: impl Into<String>, code: ErrorCode) {
        self.state.lock().key_failures.insert(
            key.into(),
            KeyFailure {
                code,
                remaining: None,
            },
        );
    }

    /// Fail the row with `key` with `code` on its next `times` [`MockReply::AllOk`] attempts.
    pub fn fail_key_times(&self, key: impl Into<String>, code: ErrorCode, times: usize) {
        self.state.lock().key_failures.insert(
            key.into(),
            KeyFailure {
                code,
                remaining: Some(times),
            },
        );
    }

    /// The row keys of every batch received, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// The highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn reply(&self, batch: &WireBatch) -> Result<WireResponse, TransportError> {
        let rows = MockCodec::decode_batch(batch)
            .map_err(|e| TransportError::rejected(ErrorCode::ParameterInvalid, e.to_string()))?;
        let keys = rows.iter().map(|r| r.key().to_string()).collect::<Vec<_>>();

        let mut state = self.state.lock();
        state.calls.push(keys.clone());

        let outcomes = match state.replies.pop_front().unwrap_or(MockReply::AllOk) {
            MockReply::Transport(e) => return Err(e),
            MockReply::Raw(response) => return Ok(response),
            MockReply::Rows(statuses) => statuses
                .into_iter()
                .map(|status| match status {
                    Ok(()) => RowOutcome::Success,
                    Err(code) => RowOutcome::failed(code, "scripted failure"),
                })
                .collect::<Vec<_>>(),
            MockReply::AllOk => keys
                .iter()
                .map(|key| match state.key_failures.get_mut(key) {
                    Some(KeyFailure {
                        code,
                        remaining: None,
                    }) => RowOutcome::failed(code.clone(), format!("{key} always fails")),
                    Some(KeyFailure {
                        code,
                        remaining: Some(n),
                    }) if *n > 0 => {
                        *n -= 1;
                        RowOutcome::failed(code.clone(), format!("{key} fails {n} more times"))
                    }
                    _ => RowOutcome::Success,
                })
                .collect(),
        };

        Ok(MockCodec::encode_response(&outcomes))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, batch: &WireBatch) -> Result<WireResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let reply = self.reply(batch);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::row::{PrimaryKey, RowChange};

    fn row(key: i64) -> RowMutation {
        RowMutation::new("t", PrimaryKey::new().with_column("k", key), RowChange::put())
    }

    fn encode(rows: &[RowMutation]) -> WireBatch {
        MockCodec::default()
            .encode(BucketId::new(0), &rows.iter().collect::<Vec<_>>())
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_replies() {
        let transport = MockTransport::new().with_replies([
            MockReply::Rows(vec![Ok(()), Err(ErrorCode::ServerBusy)]),
            MockReply::Transport(TransportError::timeout("slow")),
        ]);
        transport.fail_key_times("k=2", ErrorCode::Timeout, 1);

        let codec = MockCodec::default();
        let batch = encode(&[row(1), row(2)]);
        assert_eq!(batch.row_count, 2);

        let outcomes = codec
            .decode(&batch, transport.send(&batch).await.unwrap())
            .unwrap();
        assert_eq!(outcomes[0], RowOutcome::Success);
        assert_eq!(outcomes[1].code(), Some(&ErrorCode::ServerBusy));

        assert_matches!(transport.send(&batch).await, Err(e) if e.code() == ErrorCode::Timeout);

        // Script exhausted: per-key failures apply, then run out.
        let outcomes = codec
            .decode(&batch, transport.send(&batch).await.unwrap())
            .unwrap();
        assert_eq!(outcomes[1].code(), Some(&ErrorCode::Timeout));
        let outcomes = codec
            .decode(&batch, transport.send(&batch).await.unwrap())
            .unwrap();
        assert!(outcomes.iter().all(RowOutcome::is_success));

        assert_eq!(transport.call_count(), 4);
        assert_eq!(transport.calls()[0], ["k=1", "k=2"]);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[test]
    fn test_unencodable_table() {
        let codec = MockCodec::default().with_unencodable_table("t");
        let r = row(1);
        assert_matches!(
            codec.encode(BucketId::new(0), &[&r]),
            Err(CodecError::Encode(_))
        );
        assert!(codec.encoded_size(&r) > 0);
    }
}
