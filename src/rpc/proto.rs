//! Wire and on-disk messages. Laid out the way prost-build emits them so the module can be swapped
//! for generated code without touching callers.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientRequestId {
    #[prost(string, tag = "1")]
    pub client: String,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bytes, tag = "2")]
    pub data: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub client_request_id: Option<ProtoClientRequestId>,
    #[prost(enumeration = "ProtoEntryKind", tag = "4")]
    pub kind: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoEntryKind {
    Command = 0,
    /// Leader no-op entry, never handed to the state machine.
    Noop = 1,
    /// `data` holds an encoded `ProtoServerConfiguration`.
    ServerConfig = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerInfo {
    #[prost(string, tag = "1")]
    pub replica_id: String,
    #[prost(bool, tag = "2")]
    pub voting: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerConfiguration {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<ProtoServerInfo>,
}

// ------- AppendEntries --------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesReq {
    #[prost(string, tag = "1")]
    pub client_node_id: String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub commit_index: u64,
    #[prost(uint64, tag = "4")]
    pub previous_log_entry_term: u64,
    #[prost(uint64, tag = "5")]
    pub previous_log_entry_index: u64,
    #[prost(message, repeated, tag = "6")]
    pub new_entries: Vec<ProtoLogEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResult {
    #[prost(oneof = "proto_append_entries_result::Result", tags = "1, 2")]
    pub result: Option<proto_append_entries_result::Result>,
}

pub mod proto_append_entries_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoAppendEntriesSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoAppendEntriesError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesSuccess {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesError {
    #[prost(oneof = "proto_append_entries_error::Err", tags = "1, 2, 3, 4")]
    pub err: Option<proto_append_entries_error::Err>,
}

pub mod proto_append_entries_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        MissingLog(super::ProtoServerMissingPreviousLog),
        #[prost(message, tag = "4")]
        ClientNotInCluster(super::ProtoClientNotInCluster),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerFault {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientStaleTerm {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerMissingPreviousLog {
    /// Index of the last entry the server holds. 0 means an empty log.
    #[prost(uint64, tag = "1")]
    pub last_log_entry_index: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientNotInCluster {}

// ------- RequestVote --------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteReq {
    #[prost(string, tag = "1")]
    pub client_node_id: String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub last_log_entry_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_entry_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteResult {
    #[prost(oneof = "proto_request_vote_result::Result", tags = "1, 2")]
    pub result: Option<proto_request_vote_result::Result>,
}

pub mod proto_request_vote_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoRequestVoteSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoRequestVoteError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteSuccess {
    #[prost(bool, tag = "1")]
    pub vote_granted: bool,
    /// The voter's term after handling the request. Lets a stale candidate step down.
    #[prost(uint64, tag = "2")]
    pub current_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteError {
    #[prost(oneof = "proto_request_vote_error::Err", tags = "1")]
    pub err: Option<proto_request_vote_error::Err>,
}

pub mod proto_request_vote_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
    }
}

// ------- InstallSnapshot --------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotReq {
    #[prost(string, tag = "1")]
    pub client_node_id: String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_included_term: u64,
    #[prost(uint64, tag = "5")]
    pub offset: u64,
    #[prost(bytes, tag = "6")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "7")]
    pub done: bool,
    /// Membership as of `last_included_index`. Empty if the leader doesn't know it.
    #[prost(message, repeated, tag = "8")]
    pub servers: Vec<ProtoServerInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResult {
    #[prost(oneof = "proto_install_snapshot_result::Result", tags = "1, 2")]
    pub result: Option<proto_install_snapshot_result::Result>,
}

pub mod proto_install_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoInstallSnapshotSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoInstallSnapshotError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotSuccess {
    #[prost(uint64, tag = "1")]
    pub next_offset: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotError {
    #[prost(oneof = "proto_install_snapshot_error::Err", tags = "1, 2, 3, 4")]
    pub err: Option<proto_install_snapshot_error::Err>,
}

pub mod proto_install_snapshot_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        ClientNotInCluster(super::ProtoClientNotInCluster),
        #[prost(message, tag = "4")]
        UnexpectedOffset(super::ProtoSnapshotOffsetMismatch),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotOffsetMismatch {
    #[prost(uint64, tag = "1")]
    pub expected_offset: u64,
}

// ------- TimeoutNow --------

/// Sent by a leader handing over leadership. The receiver starts an election right away.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTimeoutNowReq {
    #[prost(string, tag = "1")]
    pub client_node_id: String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTimeoutNowResult {
    #[prost(oneof = "proto_timeout_now_result::Result", tags = "1, 2")]
    pub result: Option<proto_timeout_now_result::Result>,
}

pub mod proto_timeout_now_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoTimeoutNowSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoTimeoutNowError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTimeoutNowSuccess {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTimeoutNowError {
    #[prost(oneof = "proto_timeout_now_error::Err", tags = "1, 2, 3")]
    pub err: Option<proto_timeout_now_error::Err>,
}

pub mod proto_timeout_now_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        ClientNotInCluster(super::ProtoClientNotInCluster),
    }
}

// ------- Persisted state --------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLocalState {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    /// Empty when no vote was cast in `current_term`.
    #[prost(string, tag = "2")]
    pub voted_for: String,
    #[prost(uint64, tag = "3")]
    pub last_applied: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotMeta {
    #[prost(uint64, tag = "1")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "2")]
    pub last_included_term: u64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(int64, tag = "4")]
    pub created_at_millis: i64,
    #[prost(message, repeated, tag = "5")]
    pub servers: Vec<ProtoServerInfo>,
}
