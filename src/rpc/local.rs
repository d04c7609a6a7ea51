use crate::rpc::proto::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoTimeoutNowReq, ProtoTimeoutNowResult,
};
use crate::rpc::{PeerTransport, RpcServer, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// LocalNetwork connects members living in the same process. Members can be cut off and
/// reconnected to simulate partitions; a disconnected member can neither send nor receive.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<String, RpcServer>,
    disconnected: HashSet<String>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes requests for `replica_id` to `server`, replacing any earlier registration.
    pub fn register(&self, replica_id: impl Into<String>, server: RpcServer) {
        self.lock().servers.insert(replica_id.into(), server);
    }

    pub fn deregister(&self, replica_id: &str) {
        self.lock().servers.remove(replica_id);
    }

    pub fn disconnect(&self, replica_id: &str) {
        self.lock().disconnected.insert(replica_id.to_string());
    }

    pub fn reconnect(&self, replica_id: &str) {
        self.lock().disconnected.remove(replica_id);
    }

    /// The transport that member `replica_id` uses to reach its peers.
    pub fn transport_for(&self, replica_id: impl Into<String>) -> Arc<dyn PeerTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            source: replica_id.into(),
        })
    }

    fn route(&self, source: &str, target: &str) -> Result<RpcServer, TransportError> {
        let inner = self.lock();
        if inner.disconnected.contains(source) || inner.disconnected.contains(target) {
            return Err(TransportError::Unreachable(target.to_string()));
        }
        inner
            .servers
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(target.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("LocalNetwork mutex guard poison")
    }
}

struct LocalTransport {
    network: LocalNetwork,
    source: String,
}

#[async_trait::async_trait]
impl PeerTransport for LocalTransport {
    async fn append_entries(
        &self,
        target: &str,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, TransportError> {
        let server = self.network.route(&self.source, target)?;
        Ok(server.handle_append_entries(request).await)
    }

    async fn request_vote(
        &self,
        target: &str,
        request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResult, TransportError> {
        let server = self.network.route(&self.source, target)?;
        Ok(server.handle_request_vote(request).await)
    }

    async fn install_snapshot(
        &self,
        target: &str,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, TransportError> {
        let server = self.network.route(&self.source, target)?;
        Ok(server.handle_install_snapshot(request).await)
    }

    async fn timeout_now(&self, target: &str, request: ProtoTimeoutNowReq) -> Result<ProtoTimeoutNowResult, TransportError> {
        let server = self.network.route(&self.source, target)?;
        Ok(server.handle_timeout_now(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::rpc::proto::proto_request_vote_result;

    fn vote_request() -> ProtoRequestVoteReq {
        ProtoRequestVoteReq {
            client_node_id: "a".into(),
            term: 1,
            last_log_entry_index: 0,
            last_log_entry_term: 0,
        }
    }

    #[tokio::test]
    async fn partitions_cut_both_directions() {
        let network = LocalNetwork::new();
        let (client, mut rx) = ActorClient::new(4);
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        network.register("b", RpcServer::new(logger, client.weak()));
        // Drain the replica side so requests complete with "actor exited".
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let from_a = network.transport_for("a");
        assert!(matches!(
            from_a.request_vote("c", vote_request()).await,
            Err(TransportError::UnknownPeer(_))
        ));

        network.disconnect("a");
        assert!(matches!(
            from_a.request_vote("b", vote_request()).await,
            Err(TransportError::Unreachable(_))
        ));

        network.reconnect("a");
        network.disconnect("b");
        assert!(matches!(
            from_a.request_vote("b", vote_request()).await,
            Err(TransportError::Unreachable(_))
        ));

        network.reconnect("b");
        let reply = from_a.request_vote("b", vote_request()).await.unwrap();
        assert!(matches!(reply.result, Some(proto_request_vote_result::Result::Err(_))));
        drop(client);
    }
}
