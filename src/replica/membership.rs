use crate::commitlog::Index;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::rpc::{ProtoServerConfiguration, ProtoServerInfo};
use prost::Message;
use std::collections::BTreeMap;
use std::io;

/// The full member list of the cluster, kept sorted by replica id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerConfiguration {
    members: Vec<ReplicaMetadata>,
}

impl ServerConfiguration {
    pub(crate) fn new(mut members: Vec<ReplicaMetadata>) -> Self {
        members.sort_by(|a, b| a.replica_id().cmp(b.replica_id()));
        members.dedup_by(|a, b| a.replica_id() == b.replica_id());
        ServerConfiguration { members }
    }

    pub(crate) fn members(&self) -> &[ReplicaMetadata] {
        &self.members
    }

    pub(crate) fn get(&self, id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.members.iter().find(|member| member.replica_id() == id)
    }

    pub(crate) fn contains(&self, id: &ReplicaId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn num_voting(&self) -> usize {
        self.members.iter().filter(|member| member.is_voting()).count()
    }

    /// Adds `member`, or replaces the member with the same id.
    pub(crate) fn with_member(&self, member: ReplicaMetadata) -> Self {
        let mut members: Vec<ReplicaMetadata> = self
            .members
            .iter()
            .filter(|existing| existing.replica_id() != member.replica_id())
            .cloned()
            .collect();
        members.push(member);
        Self::new(members)
    }

    pub(crate) fn without_member(&self, id: &ReplicaId) -> Self {
        ServerConfiguration {
            members: self
                .members
                .iter()
                .filter(|member| member.replica_id() != id)
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn to_proto(&self) -> Vec<ProtoServerInfo> {
        self.members
            .iter()
            .map(|member| ProtoServerInfo {
                replica_id: member.replica_id().as_str().to_string(),
                voting: member.is_voting(),
            })
            .collect()
    }

    /// None for an empty list, which stands for "unknown".
    pub(crate) fn from_proto(servers: Vec<ProtoServerInfo>) -> Option<Self> {
        if servers.is_empty() {
            return None;
        }
        let members = servers
            .into_iter()
            .map(|server| ReplicaMetadata::new(ReplicaId::new(server.replica_id), server.voting))
            .collect();
        Some(Self::new(members))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let proto = ProtoServerConfiguration {
            servers: self.to_proto(),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        // Encoding only fails when the buffer is too small, and a Vec grows.
        let _ = proto.encode(&mut bytes);
        bytes
    }

    pub(crate) fn decode(bytes: &[u8]) -> io::Result<Self> {
        let proto = ProtoServerConfiguration::decode(bytes).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Undecodable server configuration: {}", e))
        })?;
        Self::from_proto(proto.servers)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Server configuration has no members"))
    }
}

/// MembershipHistory tracks which configuration is in effect at each point of the retained log.
/// A configuration takes effect as soon as its entry is appended, committed or not, so dropping
/// the entry falls back to the configuration before it.
pub(crate) struct MembershipHistory {
    // In effect before the first retained configuration entry.
    base: ServerConfiguration,
    changes: BTreeMap<Index, ServerConfiguration>,
}

impl MembershipHistory {
    pub(crate) fn new(base: ServerConfiguration) -> Self {
        MembershipHistory {
            base,
            changes: BTreeMap::new(),
        }
    }

    pub(crate) fn latest(&self) -> &ServerConfiguration {
        self.changes.values().next_back().unwrap_or(&self.base)
    }

    /// Index of the newest configuration entry still in the log.
    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.changes.keys().next_back().copied()
    }

    pub(crate) fn at(&self, index: Index) -> &ServerConfiguration {
        self.changes
            .range(..=index)
            .next_back()
            .map(|(_, configuration)| configuration)
            .unwrap_or(&self.base)
    }

    pub(crate) fn record(&mut self, index: Index, configuration: ServerConfiguration) {
        self.changes.insert(index, configuration);
    }

    /// Forgets configuration entries at `index` and later. Returns true if any were dropped.
    pub(crate) fn truncate_from(&mut self, index: Index) -> bool {
        !self.changes.split_off(&index).is_empty()
    }

    /// Folds everything up to `index` into the base, once those entries may be compacted away.
    pub(crate) fn compact_through(&mut self, index: Index) {
        let retained = self.changes.split_off(&index.plus(1));
        let folded = std::mem::replace(&mut self.changes, retained);
        if let Some((_, configuration)) = folded.into_iter().next_back() {
            self.base = configuration;
        }
    }

    /// Moves onto an installed snapshot at `index`. `suffix_kept` says whether log entries after
    /// the snapshot survived.
    pub(crate) fn reset_to_snapshot(
        &mut self,
        index: Index,
        configuration: Option<ServerConfiguration>,
        suffix_kept: bool,
    ) {
        if suffix_kept {
            self.compact_through(index);
        } else {
            self.changes.clear();
        }
        if let Some(configuration) = configuration {
            self.base = configuration;
        }
    }
}
