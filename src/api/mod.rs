//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod commit_stream;
mod event_bus;
mod membership;
mod options;
mod replicated_log;
mod state_machine;
mod types;
mod wiring;

pub use client::RaftClient;
pub use client::RaftState;
pub use client::ReplicaExited;
pub use client::SnapshotError;
pub use client::SnapshotInfo;
pub use commit_stream::RaftCommitStream;
pub use commit_stream::RaftCommittedEntry;
pub use event_bus::ClusterState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use event_bus::RaftRole;
pub use membership::LeadershipTransferError;
pub use membership::MembershipChangeError;
pub use options::RaftOptions;
pub use replicated_log::AppendEntryInput;
pub use replicated_log::AppendEntryOutput;
pub use replicated_log::AppendError;
pub use replicated_log::ReplicatedLog;
pub use state_machine::ApplyError;
pub use state_machine::CommitApplier;
pub use state_machine::RecoveryCohort;
pub use state_machine::SnapshotCohort;
pub use state_machine::StateMachine;
pub use state_machine::StateSnapshot;
pub use types::ClientRequestId;
pub use types::RaftEntryId;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use wiring::try_create_raft_client;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
pub use wiring::StorageConfig;

// So Replica can publish to the commit stream.
pub(crate) use commit_stream::new as new_commit_stream;
pub(crate) use commit_stream::RaftCommitStreamPublisher;
