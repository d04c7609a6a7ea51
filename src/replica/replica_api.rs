use crate::commitlog::Index;
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::local_state::Term;
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::write_ahead_log::{EntryOrigin, WriteAheadLogEntry};
use bytes::Bytes;
use std::io;

#[derive(Debug)]
pub(crate) struct ClientAppendInput {
    pub(crate) data: Bytes,
    pub(crate) client_request_id: Option<EntryOrigin>,
}

/// Position of the appended entry. The callback that carries this fires only once the entry is
/// applied locally.
#[derive(Debug)]
pub(crate) struct ClientAppendOutput {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ClientAppendError {
    #[error("I'm not leader")]
    LeaderRedirect(ReplicaId),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Leader can't reach a majority of voting members")]
    NoQuorum,

    // Retry shortly; a new leader is about to take over.
    #[error("Leader is handing over leadership")]
    TransferringLeadership,

    #[error("Leadership was lost before the entry committed")]
    NotCommitted,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    pub(crate) current_term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Failed to persist vote: {0:?}")]
    LocalIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
    pub(crate) configuration: Option<ServerConfiguration>,
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) done: bool,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) next_offset: u64,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Snapshot chunk at offset {offset} doesn't continue the staged data")]
    UnexpectedOffset { offset: u64, expected_offset: u64 },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("State machine rejected the snapshot: {0}")]
    SnapshotRejected(String),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

/// Sent by a leader handing over to us. Start an election right away.
#[derive(Debug)]
pub(crate) struct TimeoutNowInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
}

#[derive(Debug)]
pub(crate) struct TimeoutNowOutput {}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TimeoutNowError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are not a voting member")]
    NotVoting,
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TimeoutNowReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<(), String>,
}

#[derive(Debug)]
pub(crate) enum MembershipChange {
    AddServer(ReplicaMetadata),
    RemoveServer(ReplicaId),
    ChangeVotingStatus(Vec<ReplicaMetadata>),
}

/// Membership once the change committed.
#[derive(Debug)]
pub(crate) struct MembershipChangeOutput {
    pub(crate) members: Vec<ReplicaMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MembershipChangeError {
    #[error("I'm not leader")]
    LeaderRedirect(ReplicaId),
    #[error("No one is leader")]
    NoLeader,
    #[error("Leader can't reach a majority of voting members")]
    NoQuorum,
    #[error("Server {0:?} is already a member")]
    AlreadyExists(ReplicaId),
    #[error("Server {0:?} is not a member")]
    DoesNotExist(ReplicaId),
    #[error("Unsupported change: {0}")]
    NotSupported(String),
    #[error("Leadership was lost before the change committed")]
    NotCommitted,
    #[error("Change didn't complete in time")]
    Timeout,
    #[error("An earlier change didn't complete in time")]
    PriorRequestConsensusTimeout,
    #[error("Failed to persist log")]
    LocalIoError(io::Error),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LeadershipTransferError {
    #[error("I'm not leader")]
    LeaderRedirect(ReplicaId),
    #[error("No one is leader")]
    NoLeader,
    #[error("No voting member can take over: {0}")]
    NoTarget(String),
    #[error("A leadership transfer is already in progress")]
    InProgress,
    #[error("Target didn't take over in time")]
    Timeout,
    #[error("Target refused to start an election: {0}")]
    TargetRefused(String),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted { voter_term: Term },
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: PeerRequestDescriptor,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

/// Identifies the leader request a reply belongs to.
#[derive(Debug)]
pub(crate) struct PeerRequestDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    StaleTerm { new_term: Term },
    RetryableFailure(String),
    // No reply at all. Doesn't count as contact for quorum tracking.
    Unreachable(String),
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) descriptor: PeerRequestDescriptor,
    pub(crate) done: bool,
    pub(crate) result: Result<u64, InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    StaleTerm { new_term: Term },
    UnexpectedOffset { expected_offset: u64 },
    RetryableFailure(String),
    Unreachable(String),
}

/// HeartbeatTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// Result of a snapshot capture that ran off the replica task.
#[derive(Debug)]
pub(crate) struct SnapshotCaptured {
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
    pub(crate) configuration: Option<ServerConfiguration>,
    pub(crate) result: io::Result<crate::io::SharedFileBackedOutputStream>,
}

#[derive(Debug)]
pub(crate) struct TakeSnapshotOutput {
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TakeSnapshotError {
    #[error("Nothing has been applied yet")]
    NothingApplied,
    #[error("Snapshot capture failed: {0:?}")]
    LocalIoError(io::Error),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Point-in-time view of the replica for diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct RaftStateReport {
    pub(crate) replica_id: ReplicaId,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) election_state: ElectionStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_applied: Option<Index>,
    pub(crate) last_log_entry: Option<(Term, Index)>,
    pub(crate) snapshot_point: Option<(Term, Index)>,
    pub(crate) retained_entries: u64,
    pub(crate) apply_halted: bool,
    pub(crate) members: Vec<ReplicaMetadata>,
}
