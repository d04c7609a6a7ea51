use crate::commitlog::Index;
use crate::replica;
use crate::replica::Term;

/// Opaque position of an entry in the replicated log. Returned by appends and carried by committed
/// entries, so the application can match them up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) entry_index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.entry_index.as_u64()
    }
}

#[derive(Clone, Debug)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    /// Non-voting members receive the log but are ignored for elections and commit majorities.
    pub voting: bool,
}

impl RaftMemberInfo {
    pub fn voting(replica_id: impl Into<String>) -> Self {
        RaftMemberInfo {
            replica_id: replica_id.into(),
            voting: true,
        }
    }

    pub fn non_voting(replica_id: impl Into<String>) -> Self {
        RaftMemberInfo {
            replica_id: replica_id.into(),
            voting: false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
}

/// Identifies one client write across retries. A state machine that remembers the highest
/// `sequence` applied per `client` can drop duplicates caused by a retry after `Timeout`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientRequestId {
    pub client: String,
    pub sequence: u64,
}

impl ClientRequestId {
    pub fn new(client: impl Into<String>, sequence: u64) -> Self {
        ClientRequestId {
            client: client.into(),
            sequence,
        }
    }
}

// ------- Conversions --------

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(replica::ReplicaId::new(member_info.replica_id), member_info.voting)
    }
}

impl From<replica::ReplicaId> for RaftLeaderInfo {
    fn from(leader_id: replica::ReplicaId) -> Self {
        RaftLeaderInfo {
            replica_id: leader_id.into_inner(),
        }
    }
}

impl From<ClientRequestId> for replica::EntryOrigin {
    fn from(id: ClientRequestId) -> Self {
        replica::EntryOrigin {
            client: id.client,
            sequence: id.sequence,
        }
    }
}

impl From<replica::EntryOrigin> for ClientRequestId {
    fn from(origin: replica::EntryOrigin) -> Self {
        ClientRequestId {
            client: origin.client,
            sequence: origin.sequence,
        }
    }
}
