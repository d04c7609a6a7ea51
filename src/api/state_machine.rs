use crate::api::commit_stream::RaftCommittedEntry;
use crate::codec::CodecError;
use std::io;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Payload rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO failure while applying: {0}")]
    Io(#[from] io::Error),
}

/// CommitApplier receives every committed entry exactly once, in index order, on every member.
pub trait CommitApplier {
    fn apply_committed(&mut self, entry: &RaftCommittedEntry) -> Result<(), ApplyError>;
}

/// An immutable view of the state machine, serialized off the replica task.
pub trait StateSnapshot: Send {
    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()>;
}

pub trait SnapshotCohort {
    /// Must be cheap; the heavy lifting belongs in `StateSnapshot::write_to`.
    fn capture_state(&self) -> Box<dyn StateSnapshot>;

    /// Replaces the whole state with the decompressed bytes a `StateSnapshot` wrote.
    fn apply_snapshot(&mut self, source: &mut dyn Read) -> Result<(), ApplyError>;
}

/// RecoveryCohort replays entries that were applied before a restart. Entries arrive in batches
/// of at most `max_batch_size`; `apply_recovery_batch` closes each batch.
pub trait RecoveryCohort {
    fn start_recovery_batch(&mut self, max_batch_size: usize);
    fn append_recovered_entry(&mut self, entry: &RaftCommittedEntry) -> Result<(), ApplyError>;
    fn apply_recovery_batch(&mut self) -> Result<(), ApplyError>;
}

pub trait StateMachine: CommitApplier + SnapshotCohort + RecoveryCohort + Send + 'static {}

impl<T> StateMachine for T where T: CommitApplier + SnapshotCohort + RecoveryCohort + Send + 'static {}
