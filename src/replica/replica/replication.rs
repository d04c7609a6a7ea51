use super::Replica;
use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::replica::election::{CurrentLeader, PeerStateUpdate, SnapshotTransfer};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::{majority, Peer, ReplicaId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerError, HeartbeatTick, PeerRequestDescriptor, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLog, WriteAheadLogEntry};
use crate::rpc::{
    index_to_proto, log_entry_metadata_to_proto, log_entry_to_proto, proto_append_entries_error,
    proto_append_entries_result, ProtoAppendEntriesReq, ProtoAppendEntriesResult, TransportError,
};
use std::collections::HashSet;
use std::{cmp, io};
use tokio::time::error::Elapsed;
use tokio::time::{Duration, Instant};

enum ReplicateError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
    SnapshotUnavailable,
    LeaderStateMissingPeer {
        leader_state_tracker_peers: HashSet<ReplicaId>,
    },
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // Ensure leader is known member.
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(AppendEntriesError::ClientNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .observe_term(input.leader_term, Some(input.leader_id.clone()))
            .map_err(AppendEntriesError::ServerIoError)?;
        if !increased {
            self.accept_leader_of_current_term(&input.leader_id)
                .map_err(AppendEntriesError::ClientTermOutOfDate)?;
        }
        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            let matches = self
                .has_matching_entry(leader_prev_entry_term, leader_prev_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?;
            if !matches {
                // Our last index lets the leader skip straight back instead of probing one entry
                // per round trip.
                return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                    last_log_index: self.wal.latest_entry().map(|(_, index)| index),
                });
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let first_new_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut membership_changed = false;
        let appended = self.append_leader_entries(first_new_index, input.new_entries, &mut membership_changed);
        if membership_changed {
            self.apply_latest_configuration();
        }
        let next_entry_index = appended.map_err(AppendEntriesError::ServerIoError)?;

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            self.wal
                .ratchet_fwd_commit_index_if_changed(cmp::min(leader_commit_index, index_of_last_new_entry));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    /// Writes the leader's entries starting at `next_entry_index`, dropping our conflicting
    /// suffix. Returns the index after the last new entry.
    fn append_leader_entries(
        &mut self,
        mut next_entry_index: Index,
        new_entries: Vec<WriteAheadLogEntry>,
        membership_changed: &mut bool,
    ) -> Result<Index, io::Error> {
        let snapshot_index = self.wal.snapshot_point().map(|(_, index)| index);
        for new_entry in new_entries {
            let entry_index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            // Compacted entries are committed, so they already match.
            if Some(entry_index) <= snapshot_index {
                continue;
            }

            match self.wal.term_at(entry_index)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => {
                    self.wal.truncate(entry_index)?;
                    *membership_changed |= self.membership.truncate_from(entry_index);
                }
                None => {}
            }

            let configuration = match new_entry.kind {
                EntryKind::ServerConfig => Some(ServerConfiguration::decode(&new_entry.data)?),
                _ => None,
            };

            // 4. (append)
            let appended_index = self.wal.append(new_entry)?;
            assert_eq!(appended_index, entry_index, "Appended log entry to unexpected index.");
            if let Some(configuration) = configuration {
                self.membership.record(entry_index, configuration);
                *membership_changed = true;
            }
        }
        Ok(next_entry_index)
    }

    /// Called for AppendEntries and InstallSnapshot from a leader of our current term.
    pub(super) fn accept_leader_of_current_term(&mut self, leader_id: &ReplicaId) -> Result<(), TermOutOfDateInfo> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => {
                slog::crit!(
                    self.logger,
                    "{:?} claims leadership of term {:?}, which is ours. Rejecting.",
                    leader_id,
                    self.local_state.current_term()
                );
                Err(TermOutOfDateInfo {
                    current_term: self.local_state.current_term(),
                })
            }
            _ if self.election_state.is_candidate() => {
                // > If AppendEntries RPC received from new leader: convert to follower
                self.become_follower(Some(leader_id.clone()));
                Ok(())
            }
            _ => {
                self.election_state.set_leader_if_unknown(leader_id);
                Ok(())
            }
        }
    }

    fn has_matching_entry(&self, term: Term, index: Index) -> Result<bool, io::Error> {
        if matches!(self.wal.snapshot_point(), Some((_, snapshot_index)) if index <= snapshot_index) {
            return Ok(true);
        }
        Ok(self.wal.term_at(index)? == Some(term))
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let peer_id = reply.descriptor.peer_id;
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        // 1. Check for stale term rejection
        let heard_back = !matches!(reply.result, Err(AppendEntriesReplyFromPeerError::Unreachable(_)));
        let mut send_next_now = false;
        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.observe_term(new_term, None) {
                    Ok(true) => return,
                    Ok(false) => {
                        slog::warn!(logger, "This should not happen (unless peer has bug). Treating non-incrementing StaleTerm err as generic failure.");
                        PeerStateUpdate::OtherError
                    }
                    Err(e) => {
                        slog::error!(logger, "Failed to persist newer term {:?}: {:?}", new_term, e);
                        return;
                    }
                }
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last index: {:?}", last_log_index);
                send_next_now = true;
                PeerStateUpdate::PeerLogBehind { last_log_index }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::Unreachable(err_msg)) => {
                slog::debug!(logger, "Peer unreachable: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(()) => {
                slog::debug!(logger, "Successful AE reply");
                send_next_now = true;
                PeerStateUpdate::Success {
                    previous_log_entry: reply.previous_log_entry_index,
                    num_entries_replicated: reply.num_log_entries,
                }
            }
        };

        // 2. Update peer log tracker
        let next_index = {
            let leader_state = match self.election_state.leader_state_mut() {
                Some(leader_state) => leader_state,
                None => {
                    slog::info!(logger, "No longer leader");
                    return;
                }
            };
            let peer_state = match leader_state.peer_state_mut(&peer_id) {
                Some(peer_state) => peer_state,
                None => {
                    slog::warn!(logger, "Peer not found while handling AE reply");
                    return;
                }
            };
            if heard_back {
                peer_state.record_contact(Instant::now());
            }
            if !peer_state.handle_reply(&logger, reply.descriptor.seq_no, peer_log_update) {
                return;
            }
            peer_state.next_and_previous_log_index().0
        };

        // 3. Check for majority replication and apply new commits.
        self.advance_leader_commit_index();

        // 4. Keep a catching-up peer busy instead of waiting for its next heartbeat.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if send_next_now && matches!(self.wal.latest_entry(), Some((_, last)) if last >= next_index) {
            self.replicate_to_peer(&peer_id, current_term);
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Then moves membership changes and leadership transfers along, which wait on peer progress
    /// and commits.
    pub(super) fn advance_leader_commit_index(&mut self) {
        if self.election_state.leader_state().is_none() {
            return;
        }
        self.ratchet_leader_commit_index();
        self.advance_membership_changes();
        self.check_leadership_transfer();
    }

    pub(super) fn ratchet_leader_commit_index(&mut self) {
        let peers_matched_index = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.voting_peers_matched(),
            None => return,
        };
        let my_latest_index = self.wal.latest_entry().map(|(_, index)| index);
        let i_am_voting = self.cluster_tracker.am_i_voting();
        let tentative_new_commit_index =
            match Self::get_cluster_commit_index(peers_matched_index, my_latest_index, i_am_voting) {
            Some(index) => index,
            None => return,
        };

        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.apply_committed_entries(),
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }

    /// `peers_matched_indexes` covers voting peers only. A voting leader counts its own log,
    /// which is always the longest.
    pub(super) fn get_cluster_commit_index(
        mut peers_matched_indexes: Vec<Option<Index>>,
        my_latest_index: Option<Index>,
        i_am_voting: bool,
    ) -> Option<Index> {
        if i_am_voting {
            peers_matched_indexes.push(my_latest_index);
        }
        if peers_matched_indexes.is_empty() {
            return None;
        }
        peers_matched_indexes.sort();

        // The highest index held by a majority: with n sorted voters, the majority(n) largest
        // entries all reach at least the one at n - majority(n).
        let num_voters = peers_matched_indexes.len();
        let quorum_idx = num_voters - majority(num_voters);

        peers_matched_indexes.remove(quorum_idx)
    }

    pub(crate) fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received heartbeat tick for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.refresh_quorum_tracking();
        self.replicate_to_peer(&tick.peer_id, tick.term);
    }

    fn refresh_quorum_tracking(&mut self) {
        let window = self.options.isolated_check_interval;
        let flipped = match self.election_state.leader_state_mut() {
            Some(leader_state) => {
                leader_state.refresh_quorum_active(Instant::now(), window, self.cluster_tracker.am_i_voting())
            }
            None => None,
        };

        match flipped {
            Some(false) => slog::warn!(
                self.logger,
                "Haven't heard from a majority of voting peers in {:?}. Rejecting writes.",
                window
            ),
            Some(true) => slog::info!(self.logger, "Majority of voting peers reachable again."),
            None => return,
        }
        self.election_state.notify_quorum_change();
    }

    pub(super) fn replicate_to_all_peers(&mut self, term: Term) {
        let peer_ids = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.replicate_to_peer(&peer_id, term);
        }
    }

    pub(super) fn replicate_to_peer(&mut self, peer_id: &ReplicaId, term: Term) {
        let peer = match self.cluster_tracker.peer(peer_id) {
            Some(peer) => peer.clone(),
            None => {
                slog::error!(self.logger, "Missing Peer {:?} in ClusterTracker", peer_id);
                return;
            }
        };

        match self.try_replicate_to_peer(&peer, term) {
            Ok(_) => {}
            Err(ReplicateError::NoLongerLeader) => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(ReplicateError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} still outstanding", peer_id)
            }
            Err(ReplicateError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
            }
            Err(ReplicateError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Wtf! LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(ReplicateError::SnapshotUnavailable) => {
                slog::info!(
                    self.logger,
                    "Peer {:?} needs compacted entries but no snapshot is ready yet",
                    peer_id
                );
                self.start_snapshot_capture();
            }
            Err(ReplicateError::LeaderStateMissingPeer {
                leader_state_tracker_peers,
            }) => {
                slog::error!(
                    self.logger,
                    "Wtf. Peer {:?} is present in ClusterTracker but missing in LeaderStateTracker. LeaderStateTracker peers: [{:?}]",
                    peer_id,
                    leader_state_tracker_peers,
                )
            }
        }
    }

    fn try_replicate_to_peer(&mut self, peer: &Peer, current_term: Term) -> Result<(), ReplicateError> {
        let peer_id = peer.metadata.replica_id();
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(ReplicateError::NoLongerLeader)?;
        let peer_state = match leader_state.peer_state_mut(peer_id) {
            Some(peer_state) => peer_state,
            None => {
                return Err(ReplicateError::LeaderStateMissingPeer {
                    leader_state_tracker_peers: leader_state.peer_ids(),
                })
            }
        };

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched, up to `max_entries_per_append`.
        if peer_state.has_outstanding_request() {
            return Err(ReplicateError::PeerConcurrencyThrottle);
        }

        // Entries the peer needs were compacted away. Stream the latest snapshot instead.
        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        if peer_state.snapshot_transfer().is_none() && needs_snapshot(&self.wal, next_index) {
            let latest = self.snapshots.latest().ok_or(ReplicateError::SnapshotUnavailable)?;
            slog::info!(
                self.logger,
                "Peer {:?} needs index {:?}, behind our log start. Sending snapshot at {:?}.",
                peer_id,
                next_index,
                latest.index
            );
            peer_state.start_snapshot_transfer(SnapshotTransfer {
                last_included_term: latest.term,
                last_included_index: latest.index,
                configuration: latest.configuration.clone(),
                data: latest.stream.acquire(),
                size: latest.stream.count(),
                offset: 0,
            });
        }

        if let Some(transfer) = peer_state.snapshot_transfer() {
            let built = Self::new_install_snapshot_request(
                current_term,
                &self.my_replica_id,
                transfer,
                self.options.snapshot_chunk_size,
            );
            let (proto_request, done) = match built {
                Ok(built) => built,
                Err(e) => {
                    // Start over from the latest snapshot on the next attempt.
                    let snapshot_index = transfer.last_included_index;
                    peer_state.abort_snapshot_transfer();
                    return Err(ReplicateError::DiskRead(snapshot_index, e));
                }
            };
            let descriptor = PeerRequestDescriptor {
                peer_id: peer_id.clone(),
                term: current_term,
                seq_no: peer_state.next_seq_no(),
            };

            tokio::task::spawn(Self::call_peer_install_snapshot(
                self.logger.clone(),
                peer.clone(),
                proto_request,
                self.options.append_entries_timeout,
                self.actor_client.clone(),
                descriptor,
                done,
            ));
            peer_state.reset_heartbeat_timer();
            return Ok(());
        }

        let opt_previous_log_entry_metadata = match opt_previous_index {
            None => None,
            Some(previous_index) => match self.wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => return Err(ReplicateError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(ReplicateError::DiskRead(previous_index, e)),
            },
        };
        let new_entries = self
            .wal
            .read_from(next_index, self.options.max_entries_per_append)
            .map_err(|e| ReplicateError::DiskRead(next_index, e))?;

        let descriptor = PeerRequestDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no: peer_state.next_seq_no(),
        };
        let num_log_entries = new_entries.len();
        let proto_request = build_append_entries_request(
            current_term,
            &self.my_replica_id,
            opt_previous_log_entry_metadata,
            self.wal.commit_index(),
            new_entries,
        );

        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.clone(),
            peer.clone(),
            proto_request,
            self.options.append_entries_timeout,
            self.actor_client.clone(),
            AppendEntriesReplyFromPeer {
                descriptor,
                previous_log_entry_index: opt_previous_index,
                num_log_entries,
                // Replaced with the real result once the call returns.
                result: Ok(()),
            },
        ));
        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoAppendEntriesReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        mut reply: AppendEntriesReplyFromPeer,
    ) {
        let peer_id = peer.metadata.replica_id().as_str();
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer.transport.append_entries(peer_id, rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        reply.result = convert_append_entries_rpc_reply(rpc_reply);
        let _ = callback.notify_append_entries_reply_from_peer(reply).await;
    }
}

/// True if the entries from `next_index` on, or the entry right before it, were compacted away.
fn needs_snapshot<L: Log<WriteAheadLogEntry>>(wal: &WriteAheadLog<L>, next_index: Index) -> bool {
    let first_index = wal.first_index();
    match next_index.checked_minus(1) {
        None => next_index < first_index,
        Some(previous_index) => {
            previous_index < first_index
                && !matches!(wal.snapshot_point(), Some((_, snapshot_index)) if snapshot_index == previous_index)
        }
    }
}

// This is the infallible parts of creating the request object.
fn build_append_entries_request(
    current_term: Term,
    my_id: &ReplicaId,
    previous_log_entry_metadata: Option<(Term, Index)>,
    commit_index: Option<Index>,
    new_entries: Vec<WriteAheadLogEntry>,
) -> ProtoAppendEntriesReq {
    let (previous_log_entry_term, previous_log_entry_index) = log_entry_metadata_to_proto(previous_log_entry_metadata);

    ProtoAppendEntriesReq {
        client_node_id: my_id.as_str().to_string(),
        term: current_term.as_u64(),
        commit_index: index_to_proto(commit_index),
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries: new_entries.into_iter().map(log_entry_to_proto).collect(),
    }
}

fn convert_append_entries_rpc_reply(
    rpc_reply: Result<Result<ProtoAppendEntriesResult, TransportError>, Elapsed>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.result {
            Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
            Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                    AppendEntriesReplyFromPeerError::RetryableFailure(format!("Explicit server fault: {:?}", payload.message)),
                ),
                Some(proto_append_entries_error::Err::StaleTerm(payload)) => Err(AppendEntriesReplyFromPeerError::StaleTerm {
                    new_term: Term::new(payload.current_term),
                }),
                Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                        last_log_index: Index::from_u64_opt(payload.last_log_entry_index),
                    })
                }
                Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => {
                    // Retry in case peer is out of date. Not expecting this in practice.
                    Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                        "Peer doesn't think we're in the cluster. Wtf?".into(),
                    ))
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Result".into(),
            )),
        },
        Ok(Err(transport_error)) => Err(AppendEntriesReplyFromPeerError::Unreachable(transport_error.to_string())),
        Err(_timeout) => Err(AppendEntriesReplyFromPeerError::Unreachable(
            "Timed out calling AppendEntries".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ProtoAppendEntriesError, ProtoServerMissingPreviousLog};

    fn missing_log(last_log_entry_index: u64) -> ProtoAppendEntriesResult {
        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index,
                })),
            })),
        }
    }

    #[test]
    fn missing_log_carries_peer_hint() {
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Ok(missing_log(7)))),
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index: Some(i) }) if i == Index::new(7)
        ));
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Ok(missing_log(0)))),
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index: None })
        ));
    }

    #[test]
    fn transport_failures_are_unreachable() {
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Err(TransportError::Unreachable("b".into())))),
            Err(AppendEntriesReplyFromPeerError::Unreachable(_))
        ));
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Ok(ProtoAppendEntriesResult { result: None }))),
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))
        ));
    }

    #[test]
    fn request_encodes_empty_log_as_zeroes() {
        let request = build_append_entries_request(Term::new(3), &ReplicaId::new("me"), None, None, vec![
            WriteAheadLogEntry::noop(Term::new(3)),
        ]);
        assert_eq!(request.previous_log_entry_index, 0);
        assert_eq!(request.previous_log_entry_term, 0);
        assert_eq!(request.commit_index, 0);
        assert_eq!(request.client_node_id, "me");
        assert_eq!(request.new_entries[0].kind, crate::rpc::ProtoEntryKind::Noop as i32);
    }
}
