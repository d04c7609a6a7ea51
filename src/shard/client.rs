use crate::api::{AppendEntryInput, AppendError, ClientRequestId, RaftEntryId, ReplicatedLog};
use crate::codec::{CodecError, NodePath, NormalizedNode};
use crate::shard::payload::ModificationBatch;
use crate::shard::state::ShardReader;
use crate::shard::tree::TreeError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Duration;

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ShardClientError {
    #[error("Modification batch is empty")]
    EmptyBatch,
    #[error("Modification doesn't apply to the current tree: {0}")]
    Rejected(#[from] TreeError),
    #[error("Failed to encode modification: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Append(#[from] AppendError),
}

/// ShardClient submits modification batches through the leader's replicated log.
///
/// Every batch gets the next sequence number of this client. Appends whose outcome is unknown
/// are retried with the same `ClientRequestId`, and the shard drops the duplicates.
pub struct ShardClient {
    client_name: String,
    last_sequence: AtomicU64,
    replicated_log: ReplicatedLog,
    reader: ShardReader,
    max_attempts: usize,
    initial_backoff: Duration,
}

impl ShardClient {
    /// `reader` should belong to the same member as `replicated_log`. Sequence numbers continue
    /// from the last one that member applied for `client_name`.
    pub fn new(client_name: impl Into<String>, replicated_log: ReplicatedLog, reader: ShardReader) -> Self {
        let client_name = client_name.into();
        let last_sequence = reader.last_sequence(&client_name).unwrap_or(0);

        ShardClient {
            client_name,
            last_sequence: AtomicU64::new(last_sequence),
            replicated_log,
            reader,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    pub fn with_retries(mut self, max_attempts: usize, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn reader(&self) -> &ShardReader {
        &self.reader
    }

    pub async fn write(&self, path: NodePath, data: NormalizedNode) -> Result<RaftEntryId, ShardClientError> {
        self.submit(ModificationBatch::new().write(path, data)).await
    }

    pub async fn merge(&self, path: NodePath, data: NormalizedNode) -> Result<RaftEntryId, ShardClientError> {
        self.submit(ModificationBatch::new().merge(path, data)).await
    }

    pub async fn delete(&self, path: NodePath) -> Result<RaftEntryId, ShardClientError> {
        self.submit(ModificationBatch::new().delete(path)).await
    }

    /// Returns once the batch is applied on this member.
    pub async fn submit(&self, batch: ModificationBatch) -> Result<RaftEntryId, ShardClientError> {
        if batch.is_empty() {
            return Err(ShardClientError::EmptyBatch);
        }
        // Catch obvious mistakes before they reach the log.
        self.reader.snapshot().prepare(&batch)?;

        let payload = bytes::Bytes::from(batch.encode()?);
        let sequence = self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = ClientRequestId::new(self.client_name.clone(), sequence);

        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            let input = AppendEntryInput::new(payload.clone()).with_client_request_id(request_id.clone());
            match self.replicated_log.append(input).await {
                Ok(output) => return Ok(output.entry_id),
                Err(AppendError::Timeout) | Err(AppendError::NotCommitted) | Err(AppendError::NoLeader)
                    if attempt < self.max_attempts =>
                {
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
