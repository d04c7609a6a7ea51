use crate::actor::{Callback, WeakActorClient};
use crate::api::{ApplyError, RaftCommitStreamPublisher, StateMachine};
use crate::commitlog::{Index, Log};
use crate::replica::election::{CurrentLeader, ElectionConfig, ElectionState};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::{MembershipHistory, ServerConfiguration};
use crate::replica::peers::{majority, ClusterTracker, Peer, ReplicaId};
use crate::replica::replica_api::{
    ClientAppendError, ClientAppendInput, ClientAppendOutput, LeadershipTransferError, RaftStateReport,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult,
    TermOutOfDateInfo,
};
use crate::replica::snapshot::{self, SnapshotIoConfig, SnapshotStore};
use crate::replica::write_ahead_log::{to_committed_entry, EntryKind, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::ElectionStateChangeListener;
use crate::rpc::{log_entry_metadata_to_proto, proto_request_vote_error, proto_request_vote_result, ProtoRequestVoteReq};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

mod reconfiguration;
mod replication;
mod snapshotting;

use reconfiguration::{LeadershipTransfer, MembershipChanges};
use snapshotting::SnapshotState;

/// Tunables the replica reads on every event. Validated and defaulted by the api layer.
#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) heartbeat_duration: Duration,
    pub(crate) election_min_timeout: Duration,
    pub(crate) election_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    pub(crate) snapshot_batch_count: u64,
    pub(crate) snapshot_data_threshold: u64,
    pub(crate) snapshot_retained_entries: u64,
    pub(crate) snapshot_chunk_size: usize,
    pub(crate) isolated_check_interval: Duration,
    pub(crate) recovery_batch_size: usize,
    pub(crate) membership_change_timeout: Duration,
    pub(crate) snapshot_io: SnapshotIoConfig,
}

pub(crate) struct ReplicaConfig<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) log: L,
    pub(crate) local_state: S,
    pub(crate) commit_stream_publisher: RaftCommitStreamPublisher,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) snapshot_store: Arc<dyn SnapshotStore>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) options: ReplicaOptions,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RecoveryError {
    #[error("IO failure during recovery: {0:?}")]
    Io(#[from] io::Error),
    #[error("State machine rejected recovered state: {0}")]
    Rejected(#[from] ApplyError),
    #[error("Applied entry {0:?} is missing from the log")]
    MissingEntry(Index),
}

/// An accepted client append that is waiting for its entry to be applied.
struct PendingAppend {
    term: Term,
    callback: Callback<ClientAppendOutput, ClientAppendError>,
}

pub(crate) struct Replica<L, S>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: S,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,
    state_machine: Box<dyn StateMachine>,
    snapshot_store: Arc<dyn SnapshotStore>,
    actor_client: WeakActorClient,
    options: ReplicaOptions,
    pending_appends: BTreeMap<Index, PendingAppend>,
    snapshots: SnapshotState,
    membership: MembershipHistory,
    membership_changes: MembershipChanges,
    leadership_transfer: Option<LeadershipTransfer>,
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    /// Restores the latest snapshot and replays applied entries before the replica starts as a
    /// follower.
    pub(crate) fn new(config: ReplicaConfig<L, S>) -> Result<(Self, ElectionStateChangeListener), RecoveryError> {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        let logger = config.logger;
        let mut wal = WriteAheadLog::new(logger.clone(), config.log, config.commit_stream_publisher)?;
        let mut state_machine = config.state_machine;

        let latest_snapshot = Self::recover_snapshot(
            &logger,
            &mut wal,
            state_machine.as_mut(),
            config.snapshot_store.as_ref(),
            &config.options.snapshot_io,
        )?;
        Self::replay_applied_entries(
            &logger,
            &mut wal,
            state_machine.as_mut(),
            config.local_state.last_applied(),
            config.options.recovery_batch_size,
        )?;

        let mut cluster_tracker = config.cluster_tracker;
        let base_configuration = latest_snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.configuration.clone())
            .unwrap_or_else(|| cluster_tracker.configuration());
        let membership = Self::recover_membership(&wal, base_configuration, config.options.recovery_batch_size)?;
        cluster_tracker.apply_configuration(membership.latest());

        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                voting: cluster_tracker.am_i_voting(),
                heartbeat_duration: config.options.heartbeat_duration,
                election_min_timeout: config.options.election_min_timeout,
                election_max_timeout: config.options.election_max_timeout,
            },
            config.actor_client.clone(),
        );

        let replica = Replica {
            logger,
            my_replica_id,
            cluster_tracker,
            local_state: config.local_state,
            election_state,
            wal,
            state_machine,
            snapshot_store: config.snapshot_store,
            actor_client: config.actor_client,
            options: config.options,
            pending_appends: BTreeMap::new(),
            snapshots: SnapshotState::new(latest_snapshot),
            membership,
            membership_changes: MembershipChanges::default(),
            leadership_transfer: None,
        };
        slog::info!(
            replica.logger,
            "Replica started. Term={:?}, LastLog={:?}, LastApplied={:?}, Snapshot={:?}, Members={:?}",
            replica.local_state.current_term(),
            replica.wal.latest_entry(),
            replica.wal.last_applied(),
            replica.wal.snapshot_point(),
            replica.membership.latest().members(),
        );

        Ok((replica, listener))
    }

    fn recover_snapshot(
        logger: &slog::Logger,
        wal: &mut WriteAheadLog<L>,
        state_machine: &mut dyn StateMachine,
        store: &dyn SnapshotStore,
        io_config: &SnapshotIoConfig,
    ) -> Result<Option<snapshotting::LatestSnapshot>, RecoveryError> {
        let stored = match store.load()? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        snapshot::restore_snapshot(&stored.data, state_machine)?;
        wal.reset_to_snapshot(stored.meta.last_included_term, stored.meta.last_included_index)?;
        slog::info!(
            logger,
            "Restored snapshot at {:?} (term {:?}) taken {}",
            stored.meta.last_included_index,
            stored.meta.last_included_term,
            stored.meta.created_at,
        );

        let stream = snapshot::load_into_spill_stream(&stored.data, io_config)?;
        Ok(Some(snapshotting::LatestSnapshot {
            term: stored.meta.last_included_term,
            index: stored.meta.last_included_index,
            configuration: stored.meta.configuration,
            stream,
        }))
    }

    /// Rebuilds the configuration history from the retained log, on top of `base`.
    fn recover_membership(
        wal: &WriteAheadLog<L>,
        base: ServerConfiguration,
        batch_size: usize,
    ) -> Result<MembershipHistory, RecoveryError> {
        let mut history = MembershipHistory::new(base);
        let latest = match wal.latest_entry() {
            Some((_, latest)) => latest,
            None => return Ok(history),
        };

        let mut next = wal.first_index();
        while next <= latest {
            let entries = wal.read_from(next, batch_size.max(1))?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if entry.kind == EntryKind::ServerConfig {
                    history.record(next, ServerConfiguration::decode(&entry.data)?);
                }
                next = next.plus(1);
            }
        }
        Ok(history)
    }

    /// Replays `(snapshot, last_applied]` through the recovery cohort. These entries were handed
    /// to the application before the restart, so they aren't published again.
    fn replay_applied_entries(
        logger: &slog::Logger,
        wal: &mut WriteAheadLog<L>,
        state_machine: &mut dyn StateMachine,
        last_applied: Option<Index>,
        batch_size: usize,
    ) -> Result<(), RecoveryError> {
        let last_applied = match last_applied {
            Some(last_applied) => last_applied,
            None => return Ok(()),
        };
        let mut next = match wal.snapshot_point() {
            Some((_, snapshot_index)) if snapshot_index >= last_applied => return Ok(()),
            Some((_, snapshot_index)) => snapshot_index.plus(1),
            None => Index::start_index(),
        };

        let batch_size = batch_size.max(1);
        let mut replayed = 0u64;
        while next <= last_applied {
            state_machine.start_recovery_batch(batch_size);
            let mut in_batch = 0;
            while in_batch < batch_size && next <= last_applied {
                let entry = wal.read(next)?.ok_or(RecoveryError::MissingEntry(next))?;
                if entry.is_command() {
                    state_machine.append_recovered_entry(&to_committed_entry(next, entry))?;
                }
                in_batch += 1;
                replayed += 1;
                next = next.plus(1);
            }
            state_machine.apply_recovery_batch()?;
        }

        wal.mark_recovered(last_applied);
        slog::info!(logger, "Replayed {} log entries up to {:?}", replayed, last_applied);
        Ok(())
    }

    // ------- Client appends --------

    pub(crate) fn handle_client_append(
        &mut self,
        input: ClientAppendInput,
        callback: Callback<ClientAppendOutput, ClientAppendError>,
    ) {
        let (term, index) = match self.try_client_append(input) {
            Ok(appended) => appended,
            Err(e) => {
                callback.send(Err(e));
                return;
            }
        };
        self.pending_appends.insert(index, PendingAppend { term, callback });

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        self.replicate_to_all_peers(term);
        self.advance_leader_commit_index();
    }

    fn try_client_append(&mut self, input: ClientAppendInput) -> Result<(Term, Index), ClientAppendError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => return Err(ClientAppendError::LeaderRedirect(leader_id)),
            CurrentLeader::Unknown => return Err(ClientAppendError::NoLeader),
        }

        if let Some(leader_state) = self.election_state.leader_state() {
            if !leader_state.quorum_active() {
                return Err(ClientAppendError::NoQuorum);
            }
        }
        if self.leadership_transfer.is_some() {
            return Err(ClientAppendError::TransferringLeadership);
        }

        let term = self.local_state.current_term();
        let new_entry = WriteAheadLogEntry::new(term, input.client_request_id, input.data.to_vec());
        let appended_index = self.wal.append(new_entry).map_err(ClientAppendError::LocalIoError)?;

        Ok((term, appended_index))
    }

    /// Applies newly committed entries, persists the new last-applied index, and answers the
    /// client appends that are now done.
    fn apply_committed_entries(&mut self) {
        let last_applied = match self.wal.apply_all_committed_entries(self.state_machine.as_mut()) {
            Some(last_applied) => last_applied,
            None => return,
        };

        if let Err(e) = self.local_state.store_last_applied(last_applied) {
            // Recovery would replay fewer entries than were applied; the log still has them.
            slog::error!(self.logger, "Failed to persist last applied {:?}: {:?}", last_applied, e);
        }

        while let Some((index, pending)) = pop_first_at_or_before(&mut self.pending_appends, last_applied) {
            pending.callback.send(Ok(ClientAppendOutput {
                term: pending.term,
                index,
            }));
        }

        self.maybe_start_snapshot();
    }

    fn fail_pending_appends(&mut self) {
        let pending = std::mem::take(&mut self.pending_appends);
        if !pending.is_empty() {
            slog::info!(self.logger, "Failing {} uncommitted client appends", pending.len());
        }
        for (_, pending) in pending {
            pending.callback.send(Err(ClientAppendError::NotCommitted));
        }
    }

    // ------- Role transitions --------

    fn become_follower(&mut self, leader: Option<ReplicaId>) {
        self.fail_membership_changes(leader.as_ref());
        self.election_state.transition_to_follower(leader);
        self.fail_pending_appends();
        // Any step-down ends a handover: leadership moved on either way.
        self.finish_leadership_transfer(Ok(()));
    }

    /// Persists a newer term observed in any RPC and steps down. Returns true if the term moved.
    fn observe_term(&mut self, term: Term, leader: Option<ReplicaId>) -> io::Result<bool> {
        let increased = self.local_state.store_term_if_increased(term)?;
        if increased {
            self.become_follower(leader);
            slog::info!(
                self.logger,
                "Observed term {:?}. Transitioned to follower. Election state: {:?}",
                term,
                self.election_state
            );
        }
        Ok(increased)
    }

    fn become_leader(&mut self, term: Term) {
        let peers = self
            .cluster_tracker
            .iter_peers()
            .map(|peer| (peer.metadata.replica_id().clone(), peer.metadata.is_voting()))
            .collect();
        self.election_state
            .transition_to_leader(term, peers, self.wal.latest_entry().map(|(_, index)| index));
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // Entries from earlier terms only commit once an entry of our own term does. With nothing
        // pending, the next client entry takes that role.
        let has_uncommitted = self.wal.latest_entry().map(|(_, index)| index) > self.wal.commit_index();
        if has_uncommitted {
            if let Err(e) = self.wal.append(WriteAheadLogEntry::noop(term)) {
                slog::error!(self.logger, "Failed to append no-op for term {:?}: {:?}", term, e);
            }
        }
        self.advance_leader_commit_index();
    }

    // ------- Elections --------

    pub(crate) fn handle_election_timeout(&mut self) {
        if !self.cluster_tracker.am_i_voting() {
            return;
        }
        if self.election_state.current_leader() == CurrentLeader::Me {
            slog::debug!(self.logger, "Ignoring election timeout as leader");
            return;
        }
        self.start_election();
    }

    /// Moves to the next term as a candidate and asks the voting peers for their votes.
    fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self(&self.my_replica_id) {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist candidacy, skipping election: {:?}", e);
                return;
            }
        };
        let votes = self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Election timeout. Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if votes >= majority(self.cluster_tracker.num_voting_replicas()) {
            self.become_leader(new_term);
            return;
        }

        let request = self.new_request_vote_request(new_term);
        for peer in self.cluster_tracker.iter_voting_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                peer.clone(),
                request.clone(),
                self.actor_client.clone(),
                new_term,
                None,
            ));
        }
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        self.observe_term(input.candidate_term, None)
            .map_err(RequestVoteError::LocalIoError)?;
        let (current_term, opt_voted_for) = self.local_state.voted_for_current_term();
        let not_granted = Ok(RequestVoteOutput {
            vote_granted: false,
            current_term,
        });

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if voted_for == input.candidate_id {
                // Client retried.
                return Ok(RequestVoteOutput {
                    vote_granted: true,
                    current_term,
                });
            }
            slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
            return not_granted;
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return not_granted;
        }

        let stored = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::LocalIoError)?;
        if !stored {
            return not_granted;
        }

        slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, current_term);
        // Granting a vote counts as hearing from a viable leader.
        self.election_state.reset_timeout_if_follower();
        Ok(RequestVoteOutput {
            vote_granted: true,
            current_term,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_voting_replicas,
                    reply.term,
                );

                if num_votes_received >= majority(num_voting_replicas) {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted { voter_term } => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
                if let Err(e) = self.observe_term(voter_term, None) {
                    slog::error!(self.logger, "Failed to persist newer term {:?}: {:?}", voter_term, e);
                }
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                if !self.election_state.is_candidate() {
                    return;
                }
                match self.cluster_tracker.peer(&reply.peer_id) {
                    Some(peer) => {
                        tokio::task::spawn(Self::call_peer_request_vote(
                            self.logger.clone(),
                            peer.clone(),
                            self.new_request_vote_request(reply.term),
                            self.actor_client.clone(),
                            reply.term,
                            Some(self.options.heartbeat_duration),
                        ));
                    }
                    None => slog::error!(
                        self.logger,
                        "Peer {:?} not found while retrying RequestVote. Wtf!",
                        reply.peer_id
                    ),
                }
            }
        }
    }

    fn new_request_vote_request(&self, term: Term) -> ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = log_entry_metadata_to_proto(self.wal.latest_entry());

        ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.clone().into_inner(),
            term: term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoRequestVoteReq,
        callback: WeakActorClient,
        term: Term,
        delay: Option<Duration>,
    ) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let peer_id = peer.metadata.replica_id().clone();
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = peer.transport.request_vote(peer_id.as_str(), rpc_request).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_result = match rpc_reply {
            Ok(rpc_result) => match rpc_result.result {
                Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                    if success_reply.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted {
                            voter_term: Term::new(success_reply.current_term),
                        }
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        slog::warn!(logger, "RequestVote Service Fault: {:?}", fault.message);
                        RequestVoteResult::RetryableFailure
                    }
                    None => RequestVoteResult::MalformedReply,
                },
                None => RequestVoteResult::MalformedReply,
            },
            Err(transport_error) => {
                slog::debug!(logger, "RequestVote to {:?} failed: {}", peer_id, transport_error);
                RequestVoteResult::RetryableFailure
            }
        };

        let callback_input = RequestVoteReplyFromPeer {
            peer_id,
            term,
            result: callback_result,
        };

        let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
    }

    // ------- Diagnostics and lifecycle --------

    pub(crate) fn raft_state(&self) -> RaftStateReport {
        let (current_term, voted_for) = self.local_state.voted_for_current_term();
        RaftStateReport {
            replica_id: self.my_replica_id.clone(),
            current_term,
            voted_for,
            election_state: self.election_state.current_state(),
            commit_index: self.wal.commit_index(),
            last_applied: self.wal.last_applied(),
            last_log_entry: self.wal.latest_entry(),
            snapshot_point: self.wal.snapshot_point(),
            retained_entries: self.wal.retained_entries(),
            apply_halted: self.wal.is_apply_halted(),
            members: self.membership.latest().members().to_vec(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        slog::info!(self.logger, "Replica shutting down. Final state: {:?}", self.raft_state());
        self.snapshots.release(&self.logger);
        self.fail_membership_changes(None);
        self.finish_leadership_transfer(Err(LeadershipTransferError::ActorExited));
    }
}

/// Pops the lowest key if it's at or before `index`.
fn pop_first_at_or_before<V>(map: &mut BTreeMap<Index, V>, index: Index) -> Option<(Index, V)> {
    let first = *map.keys().next()?;
    if first > index {
        return None;
    }
    map.remove(&first).map(|value| (first, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::api::{
        ApplyError, CommitApplier, RaftCommitStream, RaftCommittedEntry, RecoveryCohort, SnapshotCohort, StateSnapshot,
    };
    use crate::commitlog::InMemoryLog;
    use crate::io::Lz4BlockSize;
    use crate::replica::peers::ReplicaMetadata;
    use crate::replica::replica_api::{AppendEntriesError, AppendEntriesInput};
    use crate::replica::snapshot::InMemorySnapshotStore;
    use crate::replica::VolatileLocalState;
    use crate::rpc::LocalNetwork;
    use std::io::{Read, Write};
    use tokio::sync::mpsc;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>, VolatileLocalState>;

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_u64_opt(v)
    }

    struct NoopStateMachine;

    struct EmptySnapshot;

    impl StateSnapshot for EmptySnapshot {
        fn write_to(&self, _sink: &mut dyn Write) -> io::Result<()> {
            Ok(())
        }
    }

    impl CommitApplier for NoopStateMachine {
        fn apply_committed(&mut self, _entry: &RaftCommittedEntry) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    impl SnapshotCohort for NoopStateMachine {
        fn capture_state(&self) -> Box<dyn StateSnapshot> {
            Box::new(EmptySnapshot)
        }

        fn apply_snapshot(&mut self, _source: &mut dyn Read) -> Result<(), ApplyError> {
            Ok(())
        }
    }

    impl RecoveryCohort for NoopStateMachine {
        fn start_recovery_batch(&mut self, _max_batch_size: usize) {}

        fn append_recovered_entry(&mut self, _entry: &RaftCommittedEntry) -> Result<(), ApplyError> {
            Ok(())
        }

        fn apply_recovery_batch(&mut self) -> Result<(), ApplyError> {
            Ok(())
        }
    }


    /// Replica "a" of the cluster {a, b, c}, driven by calling its handlers directly. Timers are
    /// long enough never to fire during a test.
    struct TestReplica {
        replica: Repl,
        _listener: ElectionStateChangeListener,
        _commit_stream: RaftCommitStream,
        _actor_client: ActorClient,
        _inbox: mpsc::Receiver<Event>,
    }

    fn test_replica() -> TestReplica {
        let members = ["a", "b", "c"]
            .iter()
            .map(|member| ReplicaMetadata::new(id(member), true))
            .collect();
        let cluster_tracker = ClusterTracker::create_valid_cluster(
            ReplicaId::new("a"),
            members,
            LocalNetwork::new().transport_for("a"),
        )
        .unwrap();
        let (publisher, commit_stream) = crate::api::new_commit_stream();
        let (actor_client, inbox) = ActorClient::new(1024);
        let hour = Duration::from_secs(3600);

        let (replica, listener) = Repl::new(ReplicaConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            cluster_tracker,
            log: InMemoryLog::new(),
            local_state: VolatileLocalState::new(),
            commit_stream_publisher: publisher,
            state_machine: Box::new(NoopStateMachine),
            snapshot_store: Arc::new(InMemorySnapshotStore::new()),
            actor_client: actor_client.weak(),
            options: ReplicaOptions {
                heartbeat_duration: hour / 4,
                election_min_timeout: hour,
                election_max_timeout: hour * 2,
                append_entries_timeout: hour / 8,
                max_entries_per_append: 64,
                snapshot_batch_count: 1_000_000,
                snapshot_data_threshold: u64::MAX,
                snapshot_retained_entries: 0,
                snapshot_chunk_size: 1024,
                isolated_check_interval: hour,
                recovery_batch_size: 16,
                membership_change_timeout: hour * 4,
                snapshot_io: SnapshotIoConfig {
                    max_chunk_size: 1024,
                    spill_threshold: 1024 * 1024,
                    spill_directory: None,
                    block_size: Lz4BlockSize::Max64Kb,
                },
            },
        })
        .unwrap();

        TestReplica {
            replica,
            _listener: listener,
            _commit_stream: commit_stream,
            _actor_client: actor_client,
            _inbox: inbox,
        }
    }

    fn id(id: &str) -> ReplicaId {
        ReplicaId::new(id)
    }

    fn entry(term: u64, b: u8) -> WriteAheadLogEntry {
        WriteAheadLogEntry::new(Term::new(term), None, vec![b])
    }

    fn vote_request(candidate: &str, term: u64, last_entry: Option<(u64, u64)>) -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(term),
            candidate_id: id(candidate),
            candidate_last_log_entry: last_entry.map(|(t, i)| (Term::new(t), Index::new(i))),
        }
    }

    fn append_request(
        leader: &str,
        term: u64,
        previous: Option<(u64, u64)>,
        commit: u64,
        new_entries: Vec<WriteAheadLogEntry>,
    ) -> AppendEntriesInput {
        AppendEntriesInput {
            leader_term: Term::new(term),
            leader_id: id(leader),
            leader_previous_log_entry: previous.map(|(t, i)| (Term::new(t), Index::new(i))),
            leader_commit_index: opt_index(commit),
            new_entries,
        }
    }

    fn granted(replica: &mut Repl, request: RequestVoteInput) -> bool {
        replica.server_handle_request_vote(request).unwrap().vote_granted
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let mut test = test_replica();
        let replica = &mut test.replica;

        assert!(granted(replica, vote_request("b", 1, None)));
        assert!(!granted(replica, vote_request("c", 1, None)));
        // A retried request from the same candidate gets the same answer.
        assert!(granted(replica, vote_request("b", 1, None)));

        // A new term means a new vote.
        assert!(granted(replica, vote_request("c", 2, None)));
        assert_eq!(replica.local_state.voted_for_current_term(), (Term::new(2), Some(id("c"))));
    }

    #[tokio::test]
    async fn vote_denied_to_candidate_with_stale_log() {
        let mut test = test_replica();
        let replica = &mut test.replica;
        replica
            .server_handle_append_entries(append_request("b", 2, None, 0, vec![entry(1, 1), entry(2, 2)]))
            .unwrap();

        // Older last term loses even with a longer log.
        assert!(!granted(replica, vote_request("c", 3, Some((1, 5)))));
        // Same last term but shorter.
        assert!(!granted(replica, vote_request("c", 3, Some((2, 1)))));
        assert!(!granted(replica, vote_request("c", 3, None)));
        // Denials don't use up the vote.
        assert!(granted(replica, vote_request("c", 3, Some((2, 2)))));
    }

    #[tokio::test]
    async fn higher_term_makes_candidate_and_leader_step_down() {
        let mut test = test_replica();
        let replica = &mut test.replica;

        replica.handle_election_timeout();
        assert!(replica.election_state.is_candidate());
        assert_eq!(replica.local_state.current_term(), Term::new(1));

        replica
            .server_handle_append_entries(append_request("b", 2, None, 0, vec![]))
            .unwrap();
        assert!(!replica.election_state.is_candidate());
        assert!(replica.election_state.current_leader() == CurrentLeader::Other(id("b")));
        assert_eq!(replica.local_state.current_term(), Term::new(2));

        replica.handle_election_timeout();
        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: id("c"),
            term: Term::new(3),
            result: RequestVoteResult::VoteGranted,
        });
        assert!(replica.election_state.current_leader() == CurrentLeader::Me);

        assert!(granted(replica, vote_request("b", 4, None)));
        assert!(replica.election_state.current_leader() != CurrentLeader::Me);
        assert_eq!(replica.local_state.current_term(), Term::new(4));
    }

    #[tokio::test]
    async fn term_never_decreases() {
        let mut test = test_replica();
        let replica = &mut test.replica;
        replica
            .server_handle_append_entries(append_request("b", 3, None, 0, vec![entry(3, 1)]))
            .unwrap();

        match replica.server_handle_append_entries(append_request("c", 2, Some((3, 1)), 1, vec![entry(2, 9)])) {
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => assert_eq!(info.current_term, Term::new(3)),
            other => panic!("Expected stale term, got {:?}", other),
        }
        match replica.server_handle_request_vote(vote_request("c", 1, Some((3, 1)))) {
            Err(RequestVoteError::RequestTermOutOfDate(info)) => assert_eq!(info.current_term, Term::new(3)),
            other => panic!("Expected stale term, got {:?}", other),
        }

        assert_eq!(replica.local_state.current_term(), Term::new(3));
        assert_eq!(replica.wal.latest_entry(), Some((Term::new(3), Index::new(1))));
        assert_eq!(replica.wal.commit_index(), None);
    }

    #[tokio::test]
    async fn conflicting_suffix_is_replaced() {
        let mut test = test_replica();
        let replica = &mut test.replica;
        replica
            .server_handle_append_entries(append_request(
                "b",
                1,
                None,
                1,
                vec![entry(1, 1), entry(1, 2), entry(1, 3)],
            ))
            .unwrap();

        // A leader of term 2 never had our entries 2 and 3.
        replica
            .server_handle_append_entries(append_request("c", 2, Some((1, 1)), 1, vec![entry(2, 20)]))
            .unwrap();
        assert_eq!(replica.wal.latest_entry(), Some((Term::new(2), Index::new(2))));
        assert_eq!(replica.wal.read(Index::new(2)).unwrap(), Some(entry(2, 20)));
        assert_eq!(replica.wal.read(Index::new(3)).unwrap(), None);

        // Entries we already have are left alone, and a stale prefix check is refused.
        replica
            .server_handle_append_entries(append_request("c", 2, None, 1, vec![entry(1, 1)]))
            .unwrap();
        assert_eq!(replica.wal.latest_entry(), Some((Term::new(2), Index::new(2))));
        match replica.server_handle_append_entries(append_request("c", 2, Some((1, 2)), 1, vec![])) {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                assert_eq!(last_log_index, opt_index(2))
            }
            other => panic!("Expected missing entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn follower_commit_is_capped_by_last_new_entry() {
        let mut test = test_replica();
        let replica = &mut test.replica;

        replica
            .server_handle_append_entries(append_request("b", 1, None, 10, vec![entry(1, 1), entry(1, 2)]))
            .unwrap();
        assert_eq!(replica.wal.commit_index(), opt_index(2));
        assert_eq!(replica.wal.last_applied(), opt_index(2));

        replica
            .server_handle_append_entries(append_request("b", 1, Some((1, 2)), 1, vec![entry(1, 3)]))
            .unwrap();
        // The leader's commit index is behind ours. Ours never goes back.
        assert_eq!(replica.wal.commit_index(), opt_index(2));

        // A heartbeat only vouches for the log up to its previous entry.
        replica
            .server_handle_append_entries(append_request("b", 1, Some((1, 2)), 3, vec![]))
            .unwrap();
        assert_eq!(replica.wal.commit_index(), opt_index(2));
        replica
            .server_handle_append_entries(append_request("b", 1, Some((1, 3)), 3, vec![]))
            .unwrap();
        assert_eq!(replica.wal.commit_index(), opt_index(3));
    }

    #[tokio::test]
    async fn new_leader_commits_earlier_terms_only_through_its_own_entry() {
        let mut test = test_replica();
        let replica = &mut test.replica;
        replica
            .server_handle_append_entries(append_request("b", 1, None, 0, vec![entry(1, 1), entry(1, 2)]))
            .unwrap();

        replica.handle_election_timeout();
        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: id("b"),
            term: Term::new(2),
            result: RequestVoteResult::VoteGranted,
        });
        assert!(replica.election_state.current_leader() == CurrentLeader::Me);

        // Term 1 entries wait for the no-op of term 2.
        assert_eq!(replica.wal.latest_entry(), Some((Term::new(2), Index::new(3))));
        assert_eq!(replica.wal.read(Index::new(3)).unwrap(), Some(WriteAheadLogEntry::noop(Term::new(2))));
        assert_eq!(replica.wal.commit_index(), None);
        assert!(!replica.wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert!(replica.wal.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());
    }

    #[tokio::test]
    async fn committed_prefix_survives_leader_change() {
        let mut test = test_replica();
        let replica = &mut test.replica;
        replica
            .server_handle_append_entries(append_request(
                "b",
                1,
                None,
                2,
                vec![entry(1, 1), entry(1, 2), entry(1, 3)],
            ))
            .unwrap();
        let committed: Vec<_> = (1..=2)
            .map(|i| replica.wal.read(Index::new(i)).unwrap())
            .collect();

        // The next leader has the committed entries and replaces only the rest.
        replica
            .server_handle_append_entries(append_request(
                "c",
                2,
                None,
                4,
                vec![entry(1, 1), entry(1, 2), entry(2, 30), entry(2, 40)],
            ))
            .unwrap();

        let after: Vec<_> = (1..=2)
            .map(|i| replica.wal.read(Index::new(i)).unwrap())
            .collect();
        assert_eq!(committed, after);
        assert_eq!(replica.wal.read(Index::new(3)).unwrap(), Some(entry(2, 30)));
        assert_eq!(replica.wal.commit_index(), opt_index(4));
        assert_eq!(replica.wal.last_applied(), opt_index(4));
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();
            let expected = opt_index(expected);

            assert_eq!(expected, Repl::get_cluster_commit_index(matches, Some(Index::new(100)), true));
        }

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0]);
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![0, 6, 7, 8, 9]);
        run(7, vec![5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
        run(7, vec![9, 8, 0, 0, 7]);

        // Single voter commits whatever it has.
        run(100, vec![]);
    }

    #[test]
    fn non_voting_leader_commits_on_peer_majority() {
        let matches = |v: Vec<u64>| v.into_iter().map(opt_index).collect::<Vec<_>>();
        let latest = Some(Index::new(100));

        assert_eq!(Repl::get_cluster_commit_index(matches(vec![]), latest, false), None);
        assert_eq!(Repl::get_cluster_commit_index(matches(vec![7]), latest, false), opt_index(7));
        assert_eq!(Repl::get_cluster_commit_index(matches(vec![9, 7]), latest, false), opt_index(7));
        assert_eq!(Repl::get_cluster_commit_index(matches(vec![9, 0, 7]), latest, false), opt_index(7));
    }

    #[test]
    fn pending_appends_pop_in_order() {
        let mut pending: BTreeMap<Index, &str> = BTreeMap::new();
        pending.insert(Index::new(3), "c");
        pending.insert(Index::new(1), "a");
        pending.insert(Index::new(2), "b");

        assert_eq!(pop_first_at_or_before(&mut pending, Index::new(2)), Some((Index::new(1), "a")));
        assert_eq!(pop_first_at_or_before(&mut pending, Index::new(2)), Some((Index::new(2), "b")));
        assert_eq!(pop_first_at_or_before(&mut pending, Index::new(2)), None);
        assert_eq!(pending.len(), 1);
    }
}
