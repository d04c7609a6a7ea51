use crate::actor::ActorClient;
use crate::api::commit_stream::RaftCommitStream;
use crate::api::event_bus::{ClusterState, RaftEventListener};
use crate::api::membership::{self, LeadershipTransferError, MembershipChangeError};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::types::RaftMemberInfo;
use crate::replica;
use crate::rpc::RpcServer;
use std::io;

/// RaftClient is the application's handle on one raft member. The member keeps running until
/// the client and every `ReplicatedLog` cloned from it are dropped.
pub struct RaftClient {
    pub(super) my_replica_id: String,
    pub(super) replicated_log: ReplicatedLog,
    pub(super) commit_stream: Option<RaftCommitStream>,
    pub(super) event_listener: RaftEventListener,
    pub(super) actor_client: ActorClient,
    pub(super) rpc_server: RpcServer,
}

impl RaftClient {
    pub fn replica_id(&self) -> &str {
        &self.my_replica_id
    }

    pub fn replicated_log(&self) -> ReplicatedLog {
        self.replicated_log.clone()
    }

    /// The commit stream has a single consumer. Returns None after the first call.
    pub fn take_commit_stream(&mut self) -> Option<RaftCommitStream> {
        self.commit_stream.take()
    }

    pub fn event_listener(&self) -> RaftEventListener {
        self.event_listener.clone()
    }

    pub fn cluster_state(&self) -> ClusterState {
        self.event_listener.cluster_state()
    }

    /// The inbound side of this member's raft RPCs, for the transport to deliver requests to.
    pub fn rpc_server(&self) -> RpcServer {
        self.rpc_server.clone()
    }

    pub async fn raft_state(&self) -> Result<RaftState, ReplicaExited> {
        self.actor_client
            .raft_state()
            .await
            .map(RaftState::from)
            .map_err(|_| ReplicaExited)
    }

    /// Captures a snapshot at the last applied entry and compacts the log behind it.
    pub async fn take_snapshot(&self) -> Result<SnapshotInfo, SnapshotError> {
        self.actor_client
            .take_snapshot()
            .await
            .map(|output| SnapshotInfo {
                last_included_term: output.last_included_term.as_u64(),
                last_included_index: output.last_included_index.as_u64(),
            })
            .map_err(SnapshotError::from)
    }

    /// Adds a member. A voting member joins as non-voting first and is promoted once it has
    /// caught up with the leader. Returns the membership after the change committed.
    pub async fn add_server(&self, member: RaftMemberInfo) -> Result<Vec<RaftMemberInfo>, MembershipChangeError> {
        self.change_membership(replica::MembershipChange::AddServer(member.into()))
            .await
    }

    /// Removes a member. Removing the leader itself makes it step down once the change commits.
    pub async fn remove_server(&self, replica_id: &str) -> Result<Vec<RaftMemberInfo>, MembershipChangeError> {
        self.change_membership(replica::MembershipChange::RemoveServer(replica::ReplicaId::new(
            replica_id,
        )))
        .await
    }

    /// Sets the voting flag of existing members, all in one configuration entry.
    pub async fn change_servers_voting_status(
        &self,
        members: Vec<RaftMemberInfo>,
    ) -> Result<Vec<RaftMemberInfo>, MembershipChangeError> {
        let members = members.into_iter().map(replica::ReplicaMetadata::from).collect();
        self.change_membership(replica::MembershipChange::ChangeVotingStatus(members))
            .await
    }

    async fn change_membership(
        &self,
        change: replica::MembershipChange,
    ) -> Result<Vec<RaftMemberInfo>, MembershipChangeError> {
        self.actor_client
            .change_membership(change)
            .await
            .map(|output| membership::members_from(output.members))
            .map_err(MembershipChangeError::from)
    }

    /// Hands leadership to `target`, or to the most caught-up voting member if None. Client
    /// appends are refused with `NoLeader` until the transfer finishes.
    pub async fn transfer_leadership(&self, target: Option<&str>) -> Result<(), LeadershipTransferError> {
        self.actor_client
            .transfer_leadership(target.map(replica::ReplicaId::new))
            .await
            .map_err(LeadershipTransferError::from)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub struct ReplicaExited;

/// Point-in-time view of a member's raft bookkeeping. Indexes and terms of 0 mean "none".
#[derive(Clone, Debug)]
pub struct RaftState {
    pub replica_id: String,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub cluster_state: ClusterState,
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub retained_entries: u64,
    /// Membership in effect on this member, which may include an uncommitted change.
    pub members: Vec<RaftMemberInfo>,
    /// Set after the state machine rejected an entry. Nothing is applied past it.
    pub apply_halted: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotInfo {
    pub last_included_term: u64,
    pub last_included_index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Nothing has been applied yet")]
    NothingApplied,
    #[error("Snapshot capture failed: {0:?}")]
    LocalIoError(io::Error),
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::RaftStateReport> for RaftState {
    fn from(report: replica::RaftStateReport) -> Self {
        let replica_id = report.replica_id.into_inner();
        let (last_log_term, last_log_index) = term_and_index(report.last_log_entry);
        let (snapshot_term, snapshot_index) = term_and_index(report.snapshot_point);

        RaftState {
            cluster_state: ClusterState::new(report.election_state, &replica_id),
            replica_id,
            current_term: report.current_term.as_u64(),
            voted_for: report.voted_for.map(|id| id.into_inner()),
            commit_index: report.commit_index.map(|i| i.as_u64()).unwrap_or(0),
            last_applied_index: report.last_applied.map(|i| i.as_u64()).unwrap_or(0),
            last_log_index,
            last_log_term,
            snapshot_index,
            snapshot_term,
            retained_entries: report.retained_entries,
            members: membership::members_from(report.members),
            apply_halted: report.apply_halted,
        }
    }
}

fn term_and_index(entry: Option<(replica::Term, crate::commitlog::Index)>) -> (u64, u64) {
    entry
        .map(|(term, index)| (term.as_u64(), index.as_u64()))
        .unwrap_or((0, 0))
}

impl From<replica::TakeSnapshotError> for SnapshotError {
    fn from(internal_error: replica::TakeSnapshotError) -> Self {
        match internal_error {
            replica::TakeSnapshotError::NothingApplied => SnapshotError::NothingApplied,
            replica::TakeSnapshotError::LocalIoError(e) => SnapshotError::LocalIoError(e),
            replica::TakeSnapshotError::ActorExited => SnapshotError::ReplicaExited,
        }
    }
}
