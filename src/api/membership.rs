use crate::api::types::{RaftLeaderInfo, RaftMemberInfo};
use crate::replica;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MembershipChangeError {
    #[error("I'm not leader")]
    NotLeader(RaftLeaderInfo),

    // Also returned while the leader is handing over leadership. Retry with backoff.
    #[error("No one is leader")]
    NoLeader,

    #[error("Leader can't reach a majority of voting members")]
    NoQuorum,

    #[error("Server {0} is already a member")]
    AlreadyExists(String),

    #[error("Server {0} is not a member")]
    DoesNotExist(String),

    #[error("Unsupported change: {0}")]
    NotSupported(String),

    // The change may still commit under a new leader. Check the membership before retrying.
    #[error("Leadership was lost before the change committed")]
    NotCommitted,

    #[error("Change didn't complete in time")]
    Timeout,

    // Queued behind a change that timed out, so it was never started.
    #[error("An earlier change didn't complete in time")]
    PriorRequestConsensusTimeout,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum LeadershipTransferError {
    #[error("I'm not leader")]
    NotLeader(RaftLeaderInfo),

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

    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

pub(super) fn members_from(members: Vec<replica::ReplicaMetadata>) -> Vec<RaftMemberInfo> {
    members.into_iter().map(RaftMemberInfo::from).collect()
}

impl From<replica::ReplicaMetadata> for RaftMemberInfo {
    fn from(metadata: replica::ReplicaMetadata) -> Self {
        RaftMemberInfo {
            replica_id: metadata.replica_id().as_str().to_string(),
            voting: metadata.is_voting(),
        }
    }
}

impl From<replica::MembershipChangeError> for MembershipChangeError {
    fn from(internal_error: replica::MembershipChangeError) -> Self {
        match internal_error {
            replica::MembershipChangeError::LeaderRedirect(leader_id) => {
                MembershipChangeError::NotLeader(RaftLeaderInfo::from(leader_id))
            }
            replica::MembershipChangeError::NoLeader => MembershipChangeError::NoLeader,
            replica::MembershipChangeError::NoQuorum => MembershipChangeError::NoQuorum,
            replica::MembershipChangeError::AlreadyExists(id) => MembershipChangeError::AlreadyExists(id.into_inner()),
            replica::MembershipChangeError::DoesNotExist(id) => MembershipChangeError::DoesNotExist(id.into_inner()),
            replica::MembershipChangeError::NotSupported(reason) => MembershipChangeError::NotSupported(reason),
            replica::MembershipChangeError::NotCommitted => MembershipChangeError::NotCommitted,
            replica::MembershipChangeError::Timeout => MembershipChangeError::Timeout,
            replica::MembershipChangeError::PriorRequestConsensusTimeout => {
                MembershipChangeError::PriorRequestConsensusTimeout
            }
            replica::MembershipChangeError::LocalIoError(e) => MembershipChangeError::LocalIoError(e),
            replica::MembershipChangeError::ActorExited => MembershipChangeError::ReplicaExited,
        }
    }
}

impl From<replica::LeadershipTransferError> for LeadershipTransferError {
    fn from(internal_error: replica::LeadershipTransferError) -> Self {
        match internal_error {
            replica::LeadershipTransferError::LeaderRedirect(leader_id) => {
                LeadershipTransferError::NotLeader(RaftLeaderInfo::from(leader_id))
            }
            replica::LeadershipTransferError::NoLeader => LeadershipTransferError::NoLeader,
            replica::LeadershipTransferError::NoTarget(reason) => LeadershipTransferError::NoTarget(reason),
            replica::LeadershipTransferError::InProgress => LeadershipTransferError::InProgress,
            replica::LeadershipTransferError::Timeout => LeadershipTransferError::Timeout,
            replica::LeadershipTransferError::TargetRefused(reason) => LeadershipTransferError::TargetRefused(reason),
            replica::LeadershipTransferError::ActorExited => LeadershipTransferError::ReplicaExited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_keep_the_member_id() {
        let converted = MembershipChangeError::from(replica::MembershipChangeError::AlreadyExists(
            replica::ReplicaId::new("d"),
        ));
        assert!(matches!(converted, MembershipChangeError::AlreadyExists(id) if id == "d"));

        let converted = LeadershipTransferError::from(replica::LeadershipTransferError::LeaderRedirect(
            replica::ReplicaId::new("b"),
        ));
        assert!(matches!(converted, LeadershipTransferError::NotLeader(info) if info.replica_id == "b"));
    }

    #[test]
    fn members_keep_voting_flag() {
        let members = members_from(vec![
            replica::ReplicaMetadata::new(replica::ReplicaId::new("a"), true),
            replica::ReplicaMetadata::new(replica::ReplicaId::new("z"), false),
        ]);
        assert_eq!(members.len(), 2);
        assert!(members[0].voting);
        assert_eq!(members[1].replica_id, "z");
        assert!(!members[1].voting);
    }
}
