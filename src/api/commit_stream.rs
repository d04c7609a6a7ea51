use crate::api::types::{ClientRequestId, RaftEntryId};
use bytes::Bytes;
use tokio::sync::mpsc;

/// An entry that a majority has stored, as seen by this member.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftCommittedEntry {
    pub entry_id: RaftEntryId,
    pub client_request_id: Option<ClientRequestId>,
    pub data: Bytes,
}

pub(crate) fn new() -> (RaftCommitStreamPublisher, RaftCommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    (RaftCommitStreamPublisher { sender: tx }, RaftCommitStream { receiver: rx })
}

pub(crate) struct RaftCommitStreamPublisher {
    sender: mpsc::UnboundedSender<RaftCommittedEntry>,
}

impl RaftCommitStreamPublisher {
    pub(crate) fn notify_commit(&self, logger: &slog::Logger, entry: RaftCommittedEntry) {
        if self.sender.send(entry).is_err() {
            slog::debug!(logger, "CommitStream has disconnected.");
        }
    }
}

/// RaftCommitStream notifies the application of every entry after the state machine applied it,
/// in log order. Entries restored during startup recovery are not re-published.
pub struct RaftCommitStream {
    receiver: mpsc::UnboundedReceiver<RaftCommittedEntry>,
}

impl RaftCommitStream {
    /// Returns None once the replica task has exited.
    pub async fn next(&mut self) -> Option<RaftCommittedEntry> {
        self.receiver.recv().await
    }
}
