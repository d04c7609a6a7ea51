mod election;
mod local_state;
mod membership;
mod peers;
mod replica;
mod replica_api;
mod snapshot;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use membership::ServerConfiguration;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::InvalidCluster;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::RecoveryError;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica::ReplicaOptions;
pub(crate) use replica_api::*;
pub(crate) use snapshot::FileSnapshotStore;
pub(crate) use snapshot::InMemorySnapshotStore;
pub(crate) use snapshot::SnapshotIoConfig;
pub(crate) use snapshot::SnapshotStore;
pub(crate) use write_ahead_log::EntryKind;
pub(crate) use write_ahead_log::EntryOrigin;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
