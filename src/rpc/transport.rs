use crate::rpc::proto::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoTimeoutNowReq, ProtoTimeoutNowResult,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("No route to peer {0}")]
    UnknownPeer(String),
}

/// PeerTransport carries raft RPCs from the local member to `target`. Implementations deliver
/// requests to the target member's `RpcServer`; the replica bounds every call with its own timeout.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn append_entries(
        &self,
        target: &str,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, TransportError>;

    async fn request_vote(
        &self,
        target: &str,
        request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResult, TransportError>;

    async fn install_snapshot(
        &self,
        target: &str,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, TransportError>;

    /// Asks `target` to start an election right away, handing leadership over to it.
    async fn timeout_now(&self, target: &str, request: ProtoTimeoutNowReq) -> Result<ProtoTimeoutNowResult, TransportError>;
}
