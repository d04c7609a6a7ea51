use crate::replica::membership::ServerConfiguration;
use crate::rpc::PeerTransport;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// ReplicaId identifies a cluster member.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReplicaMetadata {
    id: ReplicaId,
    // Non-voting members replicate but never count toward a majority.
    voting: bool,
}

impl ReplicaMetadata {
    pub(crate) fn new(id: ReplicaId, voting: bool) -> Self {
        ReplicaMetadata { id, voting }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.id
    }

    pub(crate) fn is_voting(&self) -> bool {
        self.voting
    }
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) metadata: ReplicaMetadata,
    pub(crate) transport: Arc<dyn PeerTransport>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum InvalidCluster {
    #[error("Member {0:?} is listed more than once")]
    DuplicateMember(ReplicaId),
    #[error("My replica ID {0:?} is not in the cluster config")]
    MeNotInCluster(ReplicaId),
}

/// ClusterTracker is the membership of the shard in effect right now, from the point of view of
/// one member. A member that was removed from the configuration stays as a non-voting observer
/// of itself.
pub(crate) struct ClusterTracker {
    my_metadata: ReplicaMetadata,
    i_am_member: bool,
    peers: HashMap<ReplicaId, Peer>,
    // Handed to peers that join later.
    transport: Arc<dyn PeerTransport>,
}

impl ClusterTracker {
    pub(crate) fn create_valid_cluster(
        my_replica_id: ReplicaId,
        members: Vec<ReplicaMetadata>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, InvalidCluster> {
        let mut seen = HashSet::with_capacity(members.len());
        let mut my_metadata = None;
        let mut peers = HashMap::with_capacity(members.len());

        for metadata in members {
            if !seen.insert(metadata.id.clone()) {
                return Err(InvalidCluster::DuplicateMember(metadata.id));
            }

            if metadata.id == my_replica_id {
                my_metadata = Some(metadata);
            } else {
                peers.insert(
                    metadata.id.clone(),
                    Peer {
                        metadata,
                        transport: transport.clone(),
                    },
                );
            }
        }

        match my_metadata {
            Some(my_metadata) => Ok(ClusterTracker {
                my_metadata,
                i_am_member: true,
                peers,
                transport,
            }),
            None => Err(InvalidCluster::MeNotInCluster(my_replica_id)),
        }
    }

    /// The membership this tracker currently reflects.
    pub(crate) fn configuration(&self) -> ServerConfiguration {
        let mut members: Vec<ReplicaMetadata> = self.peers.values().map(|peer| peer.metadata.clone()).collect();
        if self.i_am_member {
            members.push(self.my_metadata.clone());
        }
        ServerConfiguration::new(members)
    }

    /// Moves onto `configuration`. Peers that stay keep their transport. Returns false if nothing
    /// changed.
    pub(crate) fn apply_configuration(&mut self, configuration: &ServerConfiguration) -> bool {
        if self.configuration() == *configuration {
            return false;
        }

        let my_id = self.my_metadata.id.clone();
        match configuration.get(&my_id) {
            Some(me) => {
                self.my_metadata = me.clone();
                self.i_am_member = true;
            }
            None => {
                self.my_metadata = ReplicaMetadata::new(my_id.clone(), false);
                self.i_am_member = false;
            }
        }

        let mut peers = HashMap::with_capacity(configuration.members().len());
        for metadata in configuration.members() {
            if metadata.id == my_id {
                continue;
            }
            let transport = match self.peers.remove(&metadata.id) {
                Some(existing) => existing.transport,
                None => self.transport.clone(),
            };
            peers.insert(
                metadata.id.clone(),
                Peer {
                    metadata: metadata.clone(),
                    transport,
                },
            );
        }
        self.peers = peers;
        true
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_metadata.id
    }

    pub(crate) fn am_i_voting(&self) -> bool {
        self.my_metadata.voting
    }

    pub(crate) fn am_i_member(&self) -> bool {
        self.i_am_member
    }

    pub(crate) fn contains_member(&self, id: &ReplicaId) -> bool {
        self.peers.contains_key(id) || (self.i_am_member && &self.my_metadata.id == id)
    }

    pub(crate) fn peer(&self, id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub(crate) fn iter_voting_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|peer| peer.metadata.voting)
    }

    pub(crate) fn is_voting_peer(&self, id: &ReplicaId) -> bool {
        self.peers.get(id).map(|peer| peer.metadata.voting).unwrap_or(false)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        let me = if self.my_metadata.voting { 1 } else { 0 };
        me + self.iter_voting_peers().count()
    }
}

pub(crate) fn majority(num_voting_replicas: usize) -> usize {
    (num_voting_replicas / 2) + 1
}
