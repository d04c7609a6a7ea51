use super::Replica;
use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{Index, Log};
use crate::replica::election::CurrentLeader;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::{Peer, ReplicaId, ReplicaMetadata};
use crate::replica::replica_api::{
    LeadershipTransferError, MembershipChange, MembershipChangeError, MembershipChangeOutput, TermOutOfDateInfo,
    TimeoutNowError, TimeoutNowInput, TimeoutNowOutput, TimeoutNowReplyFromPeer,
};
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use crate::rpc::{proto_timeout_now_result, ProtoTimeoutNowReq};
use std::collections::VecDeque;
use std::io;
use tokio::time::Duration;

/// A membership change waiting for its turn. Only one change is in flight at a time.
struct PendingChange {
    id: u64,
    change: MembershipChange,
    callback: Callback<MembershipChangeOutput, MembershipChangeError>,
}

#[derive(Clone, Copy, Debug)]
enum ChangeStage {
    // The configuration entry at `index` is in the log. A voting AddServer first joins as a
    // non-voting member and gets promoted once it caught up.
    AwaitingCommit { index: Index, promote_after: bool },
    // Waiting for the new member to replicate through `target`.
    CatchingUp { target: Index },
}

struct InFlightChange {
    pending: PendingChange,
    stage: ChangeStage,
}

#[derive(Default)]
pub(super) struct MembershipChanges {
    next_id: u64,
    in_flight: Option<InFlightChange>,
    queued: VecDeque<PendingChange>,
}

impl MembershipChanges {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Leadership handover in progress. Client appends and membership changes wait until it ends.
pub(super) struct LeadershipTransfer {
    id: u64,
    target: ReplicaId,
    timeout_now_sent: bool,
    // None when the leader hands over on its own, after it stopped being a voting member.
    callback: Option<Callback<(), LeadershipTransferError>>,
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    // ------- Configuration tracking --------

    /// Points the cluster tracker and leader state at the newest configuration in the log.
    pub(super) fn apply_latest_configuration(&mut self) {
        let latest = self.membership.latest().clone();
        if !self.cluster_tracker.apply_configuration(&latest) {
            return;
        }
        slog::info!(
            self.logger,
            "Membership changed: {:?}. Member={}, Voting={}",
            latest.members(),
            self.cluster_tracker.am_i_member(),
            self.cluster_tracker.am_i_voting()
        );

        self.election_state.set_voting(self.cluster_tracker.am_i_voting());
        let peers = self
            .cluster_tracker
            .iter_peers()
            .map(|peer| (peer.metadata.replica_id().clone(), peer.metadata.is_voting()))
            .collect();
        self.election_state
            .sync_leader_peers(peers, self.wal.latest_entry().map(|(_, index)| index));
    }

    /// Leader only. The new configuration takes effect as soon as it's appended.
    fn append_configuration(&mut self, configuration: ServerConfiguration) -> io::Result<Index> {
        let term = self.local_state.current_term();
        let index = self
            .wal
            .append(WriteAheadLogEntry::server_config(term, configuration.encode()))?;
        self.membership.record(index, configuration);
        self.apply_latest_configuration();
        self.replicate_to_all_peers(term);
        Ok(index)
    }

    // ------- Membership changes --------

    pub(crate) fn handle_membership_change(
        &mut self,
        change: MembershipChange,
        callback: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => return callback.send(Err(MembershipChangeError::LeaderRedirect(leader_id))),
            CurrentLeader::Unknown => return callback.send(Err(MembershipChangeError::NoLeader)),
        }
        if let Some(leader_state) = self.election_state.leader_state() {
            if !leader_state.quorum_active() {
                return callback.send(Err(MembershipChangeError::NoQuorum));
            }
        }
        if self.leadership_transfer.is_some() {
            // Leadership is about to move. The caller retries against the new leader.
            return callback.send(Err(MembershipChangeError::NoLeader));
        }

        let id = self.membership_changes.next_id();
        slog::info!(self.logger, "Queued membership change {}: {:?}", id, change);
        self.spawn_membership_change_timeout(id);
        self.membership_changes
            .queued
            .push_back(PendingChange { id, change, callback });
        self.advance_membership_changes();
    }

    fn spawn_membership_change_timeout(&self, id: u64) {
        let actor_client = self.actor_client.clone();
        let timeout = self.options.membership_change_timeout;
        tokio::task::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_client.membership_change_timeout(id).await;
        });
    }

    pub(crate) fn handle_membership_change_timeout(&mut self, id: u64) {
        if matches!(&self.membership_changes.in_flight, Some(in_flight) if in_flight.pending.id == id) {
            if let Some(in_flight) = self.membership_changes.in_flight.take() {
                slog::warn!(
                    self.logger,
                    "Membership change {} timed out at {:?}",
                    id,
                    in_flight.stage
                );
                in_flight.pending.callback.send(Err(MembershipChangeError::Timeout));
            }
            // A member stuck catching up shouldn't block the changes behind it.
            self.advance_membership_changes();
            return;
        }

        let position = self.membership_changes.queued.iter().position(|pending| pending.id == id);
        if let Some(pending) = position.and_then(|position| self.membership_changes.queued.remove(position)) {
            slog::warn!(self.logger, "Membership change {} timed out while queued", id);
            pending
                .callback
                .send(Err(MembershipChangeError::PriorRequestConsensusTimeout));
        }
    }

    /// Moves the in-flight change along, and starts the next queued one once the previous
    /// configuration committed.
    pub(super) fn advance_membership_changes(&mut self) {
        loop {
            if self.election_state.current_leader() != CurrentLeader::Me {
                return;
            }

            let (stage, member) = match &self.membership_changes.in_flight {
                Some(in_flight) => (in_flight.stage, changed_member(&in_flight.pending.change)),
                None => {
                    if !self.start_next_membership_change() {
                        return;
                    }
                    continue;
                }
            };

            match stage {
                ChangeStage::AwaitingCommit { index, promote_after } => {
                    if self.wal.commit_index() < Some(index) {
                        return;
                    }
                    if promote_after {
                        let target = self.wal.latest_entry().map(|(_, latest)| latest).unwrap_or(index);
                        self.set_in_flight_stage(ChangeStage::CatchingUp { target });
                        continue;
                    }
                    self.complete_in_flight_change();
                }
                ChangeStage::CatchingUp { target } => {
                    let member = match member {
                        Some(member) => member,
                        None => return,
                    };
                    let matched = self
                        .election_state
                        .leader_state()
                        .and_then(|leader_state| leader_state.peer_matched(&member))
                        .flatten();
                    if matched < Some(target) {
                        return;
                    }

                    slog::info!(self.logger, "{:?} caught up through {:?}. Promoting to voting.", member, target);
                    let promoted = self
                        .membership
                        .latest()
                        .with_member(ReplicaMetadata::new(member, true));
                    match self.append_configuration(promoted) {
                        Ok(index) => {
                            self.set_in_flight_stage(ChangeStage::AwaitingCommit {
                                index,
                                promote_after: false,
                            });
                            self.ratchet_leader_commit_index();
                        }
                        Err(e) => {
                            if let Some(in_flight) = self.membership_changes.in_flight.take() {
                                in_flight.pending.callback.send(Err(MembershipChangeError::LocalIoError(e)));
                            }
                        }
                    }
                }
            }
        }
    }

    fn set_in_flight_stage(&mut self, stage: ChangeStage) {
        if let Some(in_flight) = self.membership_changes.in_flight.as_mut() {
            in_flight.stage = stage;
        }
    }

    /// Returns true if a queued change was taken off the queue.
    fn start_next_membership_change(&mut self) -> bool {
        if self.membership_changes.queued.is_empty() || self.leadership_transfer.is_some() {
            return false;
        }
        // One configuration at a time: the previous one must commit first.
        if self.membership.latest_index() > self.wal.commit_index() {
            return false;
        }
        let pending = match self.membership_changes.queued.pop_front() {
            Some(pending) => pending,
            None => return false,
        };

        match self.begin_membership_change(&pending.change) {
            Ok(stage) => {
                slog::info!(self.logger, "Started membership change {}: {:?}", pending.id, stage);
                self.membership_changes.in_flight = Some(InFlightChange { pending, stage });
                self.ratchet_leader_commit_index();
            }
            Err(e) => {
                slog::info!(self.logger, "Rejected membership change {}: {}", pending.id, e);
                pending.callback.send(Err(e));
            }
        }
        true
    }

    fn begin_membership_change(&mut self, change: &MembershipChange) -> Result<ChangeStage, MembershipChangeError> {
        let latest = self.membership.latest().clone();
        let (next, promote_after) = match change {
            MembershipChange::AddServer(member) => {
                if latest.contains(member.replica_id()) {
                    return Err(MembershipChangeError::AlreadyExists(member.replica_id().clone()));
                }
                // A voting member only counts towards the majority once it has the log.
                let joining = ReplicaMetadata::new(member.replica_id().clone(), false);
                (latest.with_member(joining), member.is_voting())
            }
            MembershipChange::RemoveServer(id) => {
                if !latest.contains(id) {
                    return Err(MembershipChangeError::DoesNotExist(id.clone()));
                }
                (latest.without_member(id), false)
            }
            MembershipChange::ChangeVotingStatus(members) => {
                let mut next = latest.clone();
                for member in members {
                    if !latest.contains(member.replica_id()) {
                        return Err(MembershipChangeError::DoesNotExist(member.replica_id().clone()));
                    }
                    next = next.with_member(member.clone());
                }
                (next, false)
            }
        };

        if next.num_voting() == 0 {
            return Err(MembershipChangeError::NotSupported(
                "At least one voting member must remain".to_string(),
            ));
        }
        let index = self
            .append_configuration(next)
            .map_err(MembershipChangeError::LocalIoError)?;
        Ok(ChangeStage::AwaitingCommit { index, promote_after })
    }

    fn complete_in_flight_change(&mut self) {
        if let Some(in_flight) = self.membership_changes.in_flight.take() {
            slog::info!(self.logger, "Membership change {} committed", in_flight.pending.id);
            in_flight.pending.callback.send(Ok(MembershipChangeOutput {
                members: self.membership.latest().members().to_vec(),
            }));
        }

        if !self.cluster_tracker.am_i_member() {
            slog::info!(self.logger, "Removed from the cluster. Stepping down.");
            self.become_follower(None);
        } else if !self.cluster_tracker.am_i_voting() && self.leadership_transfer.is_none() {
            slog::info!(self.logger, "No longer a voting member. Handing over leadership.");
            let target = self
                .election_state
                .leader_state()
                .and_then(|leader_state| leader_state.best_transfer_target());
            match target {
                Some(target) => self.start_leadership_transfer(target, None),
                None => slog::warn!(self.logger, "No voting peer to hand leadership to"),
            }
        }
    }

    /// Called when leadership is lost.
    pub(super) fn fail_membership_changes(&mut self, leader: Option<&ReplicaId>) {
        if let Some(in_flight) = self.membership_changes.in_flight.take() {
            in_flight.pending.callback.send(Err(MembershipChangeError::NotCommitted));
        }
        for pending in self.membership_changes.queued.drain(..) {
            let error = match leader {
                Some(leader_id) => MembershipChangeError::LeaderRedirect(leader_id.clone()),
                None => MembershipChangeError::NoLeader,
            };
            pending.callback.send(Err(error));
        }
    }

    // ------- Leadership transfer --------

    pub(crate) fn handle_transfer_leadership(
        &mut self,
        target: Option<ReplicaId>,
        callback: Callback<(), LeadershipTransferError>,
    ) {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => {
                return callback.send(Err(LeadershipTransferError::LeaderRedirect(leader_id)))
            }
            CurrentLeader::Unknown => return callback.send(Err(LeadershipTransferError::NoLeader)),
        }
        if self.leadership_transfer.is_some() {
            return callback.send(Err(LeadershipTransferError::InProgress));
        }

        let target = match target {
            Some(target) if target == self.my_replica_id => return callback.send(Ok(())),
            Some(target) if self.cluster_tracker.is_voting_peer(&target) => target,
            Some(target) => {
                return callback.send(Err(LeadershipTransferError::NoTarget(format!(
                    "{:?} is not a voting member",
                    target
                ))))
            }
            None => match self
                .election_state
                .leader_state()
                .and_then(|leader_state| leader_state.best_transfer_target())
            {
                Some(target) => target,
                None => {
                    return callback.send(Err(LeadershipTransferError::NoTarget(
                        "There are no voting peers".to_string(),
                    )))
                }
            },
        };
        self.start_leadership_transfer(target, Some(callback));
    }

    fn start_leadership_transfer(&mut self, target: ReplicaId, callback: Option<Callback<(), LeadershipTransferError>>) {
        let id = self.membership_changes.next_id();
        let actor_client = self.actor_client.clone();
        let timeout = self.options.election_max_timeout * 2;
        tokio::task::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_client.leadership_transfer_timeout(id).await;
        });

        slog::info!(self.logger, "Transferring leadership to {:?}. Pausing client appends.", target);
        self.leadership_transfer = Some(LeadershipTransfer {
            id,
            target: target.clone(),
            timeout_now_sent: false,
            callback,
        });
        self.replicate_to_peer(&target, self.local_state.current_term());
        self.check_leadership_transfer();
    }

    /// Tells the target to campaign once it holds our whole log.
    pub(super) fn check_leadership_transfer(&mut self) {
        let target = match &self.leadership_transfer {
            Some(transfer) if !transfer.timeout_now_sent => transfer.target.clone(),
            _ => return,
        };
        let matched = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peer_matched(&target).flatten(),
            None => return,
        };
        if matched < self.wal.latest_entry().map(|(_, index)| index) {
            return;
        }
        let peer = match self.cluster_tracker.peer(&target) {
            Some(peer) => peer.clone(),
            None => {
                self.finish_leadership_transfer(Err(LeadershipTransferError::NoTarget(format!(
                    "{:?} left the cluster",
                    target
                ))));
                return;
            }
        };

        if let Some(transfer) = self.leadership_transfer.as_mut() {
            transfer.timeout_now_sent = true;
        }
        let term = self.local_state.current_term();
        slog::info!(self.logger, "{:?} caught up. Sending TimeoutNow for term {:?}.", target, term);
        tokio::task::spawn(Self::call_peer_timeout_now(
            self.logger.clone(),
            peer,
            ProtoTimeoutNowReq {
                client_node_id: self.my_replica_id.as_str().to_string(),
                term: term.as_u64(),
            },
            self.options.append_entries_timeout,
            self.actor_client.clone(),
            term,
        ));
    }

    pub(super) fn finish_leadership_transfer(&mut self, result: Result<(), LeadershipTransferError>) {
        if let Some(transfer) = self.leadership_transfer.take() {
            match &result {
                Ok(()) => slog::info!(self.logger, "Leadership transfer to {:?} done", transfer.target),
                Err(e) => slog::warn!(self.logger, "Leadership transfer to {:?} failed: {}", transfer.target, e),
            }
            if let Some(callback) = transfer.callback {
                callback.send(result);
            }
        }
    }

    pub(crate) fn handle_leadership_transfer_timeout(&mut self, id: u64) {
        if matches!(&self.leadership_transfer, Some(transfer) if transfer.id == id) {
            self.finish_leadership_transfer(Err(LeadershipTransferError::Timeout));
            self.advance_membership_changes();
        }
    }

    pub(crate) fn handle_timeout_now_reply_from_peer(&mut self, reply: TimeoutNowReplyFromPeer) {
        if reply.term != self.local_state.current_term() {
            return;
        }
        if !matches!(&self.leadership_transfer, Some(transfer) if transfer.target == reply.peer_id) {
            return;
        }
        match reply.result {
            Ok(()) => slog::info!(self.logger, "{:?} is campaigning", reply.peer_id),
            Err(message) => {
                self.finish_leadership_transfer(Err(LeadershipTransferError::TargetRefused(message)));
                self.advance_membership_changes();
            }
        }
    }

    pub(crate) fn server_handle_timeout_now(&mut self, input: TimeoutNowInput) -> Result<TimeoutNowOutput, TimeoutNowError> {
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(TimeoutNowError::ClientNotInCluster);
        }
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(TimeoutNowError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        if !self.cluster_tracker.am_i_voting() {
            return Err(TimeoutNowError::NotVoting);
        }

        self.observe_term(input.leader_term, Some(input.leader_id.clone()))
            .map_err(TimeoutNowError::ServerIoError)?;
        slog::info!(self.logger, "{:?} is handing over leadership. Starting election.", input.leader_id);
        self.start_election();
        Ok(TimeoutNowOutput {})
    }

    async fn call_peer_timeout_now(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoTimeoutNowReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        term: Term,
    ) {
        let peer_id = peer.metadata.replica_id().clone();
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer.transport.timeout_now(peer_id.as_str(), rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let result = match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_timeout_now_result::Result::Ok(_)) => Ok(()),
                Some(proto_timeout_now_result::Result::Err(err)) => Err(format!("{:?}", err.err)),
                None => Err("Malformed TimeoutNow Result".to_string()),
            },
            Ok(Err(transport_error)) => Err(transport_error.to_string()),
            Err(_timeout) => Err("Timed out calling TimeoutNow".to_string()),
        };

        let reply = TimeoutNowReplyFromPeer { peer_id, term, result };
        let _ = callback.notify_timeout_now_reply_from_peer(reply).await;
    }
}

/// The member whose catch-up gates a voting AddServer.
fn changed_member(change: &MembershipChange) -> Option<ReplicaId> {
    match change {
        MembershipChange::AddServer(member) => Some(member.replica_id().clone()),
        _ => None,
    }
}
