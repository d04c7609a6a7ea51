use crate::actor::{self, ActorClient};
use crate::admission::{AdmissionGate, AveragingProgressTracker};
use crate::api::client::RaftClient;
use crate::api::commit_stream;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::state_machine::StateMachine;
use crate::api::types::RaftMemberInfo;
use crate::commitlog::{FileJournal, InMemoryLog, JournalError, Log};
use crate::replica::{
    ClusterTracker, FileLocalState, FileSnapshotStore, InMemorySnapshotStore, InvalidCluster, PersistentLocalState,
    RecoveryError, Replica, ReplicaConfig, ReplicaId, ReplicaOptions, SnapshotStore, VolatileLocalState,
    WriteAheadLogEntry,
};
use crate::rpc::{PeerTransport, RpcServer};
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const ACTOR_QUEUE_SIZE: usize = 256;

pub struct RaftClientConfig {
    pub my_replica_id: String,
    pub cluster_members: Vec<RaftMemberInfo>,
    pub storage: StorageConfig,
    pub logger: slog::Logger,
    pub options: RaftOptions,
    /// How this member reaches its peers.
    pub transport: Arc<dyn PeerTransport>,
    pub state_machine: Box<dyn StateMachine>,
}

/// Where a member keeps its log, term/vote and snapshots.
#[derive(Clone, Debug)]
pub enum StorageConfig {
    /// A directory the member owns. Everything survives a restart.
    Directory(PathBuf),
    /// Nothing survives a restart. Meant for tests.
    InMemory,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Storage initialization failure: {0:?}")]
    StorageInitialization(io::Error),
    #[error("Log initialization failure: {0}")]
    LogInitialization(JournalError),
    #[error("Recovery failure: {0}")]
    Recovery(String),
}

/// Recovers the member from its storage and starts it as a follower. Must be called from within
/// a tokio runtime.
pub fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let logger = config.logger;
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_replica_id = config.my_replica_id;
    let cluster_members = config.cluster_members.into_iter().map(Into::into).collect();
    let cluster_tracker =
        ClusterTracker::create_valid_cluster(ReplicaId::new(my_replica_id.clone()), cluster_members, config.transport)?;

    slog::info!(logger, "Creating raft member {} with storage {:?}", my_replica_id, config.storage);

    let parts = match config.storage {
        StorageConfig::Directory(directory) => {
            let log = FileJournal::open(&directory).map_err(RaftClientCreationError::LogInitialization)?;
            let local_state = FileLocalState::open(&directory)?;
            let snapshot_store = Arc::new(FileSnapshotStore::open(&directory)?);
            start_replica(
                logger,
                cluster_tracker,
                log,
                local_state,
                snapshot_store,
                config.state_machine,
                options.replica_options(Some(&directory)),
            )?
        }
        StorageConfig::InMemory => start_replica(
            logger,
            cluster_tracker,
            InMemoryLog::new(),
            VolatileLocalState::new(),
            Arc::new(InMemorySnapshotStore::new()),
            config.state_machine,
            options.replica_options(None),
        )?,
    };

    let tracker = Arc::new(AveragingProgressTracker::new(
        options.admission_open_limit,
        options.admission_window,
        options.leader_heartbeat_duration,
    ));
    let admission = AdmissionGate::new(tracker, options.admission_delay_ceiling);

    Ok(RaftClient {
        replicated_log: ReplicatedLog::new(parts.actor_client.clone(), admission, options.commit_timeout),
        commit_stream: Some(parts.commit_stream),
        event_listener: parts.event_listener,
        rpc_server: parts.rpc_server,
        actor_client: parts.actor_client,
        my_replica_id,
    })
}

struct StartedReplica {
    actor_client: ActorClient,
    commit_stream: commit_stream::RaftCommitStream,
    event_listener: RaftEventListener,
    rpc_server: RpcServer,
}

fn start_replica<L, S>(
    logger: slog::Logger,
    cluster_tracker: ClusterTracker,
    log: L,
    local_state: S,
    snapshot_store: Arc<dyn SnapshotStore>,
    state_machine: Box<dyn StateMachine>,
    options: ReplicaOptions,
) -> Result<StartedReplica, RaftClientCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
{
    let my_replica_id = cluster_tracker.my_replica_id().as_str().to_string();
    let (publisher, commit_stream) = commit_stream::new();
    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    let (replica, election_state_change_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        cluster_tracker,
        log,
        local_state,
        commit_stream_publisher: publisher,
        state_machine,
        snapshot_store,
        actor_client: actor_client.weak(),
        options,
    })?;

    tokio::spawn(actor::create(actor_queue_rx, replica).run_event_loop());

    Ok(StartedReplica {
        rpc_server: RpcServer::new(logger, actor_client.weak()),
        event_listener: RaftEventListener::new(election_state_change_listener, my_replica_id),
        commit_stream,
        actor_client,
    })
}

impl From<InvalidCluster> for RaftClientCreationError {
    fn from(e: InvalidCluster) -> Self {
        RaftClientCreationError::InvalidClusterInfo(e.to_string())
    }
}

impl From<io::Error> for RaftClientCreationError {
    fn from(e: io::Error) -> Self {
        RaftClientCreationError::StorageInitialization(e)
    }
}

impl From<RecoveryError> for RaftClientCreationError {
    fn from(e: RecoveryError) -> Self {
        RaftClientCreationError::Recovery(e.to_string())
    }
}
