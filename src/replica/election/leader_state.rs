use crate::commitlog::Index;
use crate::io::SharedStreamRef;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::majority;
use crate::replica::{ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
    quorum_active: bool,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker {
            peer_state,
            quorum_active: true,
        }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn contains_peer(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(super) fn add_peer(&mut self, peer_id: ReplicaId, peer_state: PeerState) {
        self.peer_state.insert(peer_id, peer_state);
    }

    /// Dropping the state stops the peer's heartbeat timer.
    pub(super) fn retain_peers(&mut self, keep: impl Fn(&ReplicaId) -> bool) {
        self.peer_state.retain(|peer_id, _| keep(peer_id));
    }

    /// Highest index known to be replicated on `peer_id`. None if the peer isn't tracked.
    pub(crate) fn peer_matched(&self, peer_id: &ReplicaId) -> Option<Option<Index>> {
        self.peer_state.get(peer_id).map(PeerState::matched)
    }

    /// The voting peer with the most of our log, the best successor for a leadership handover.
    pub(crate) fn best_transfer_target(&self) -> Option<ReplicaId> {
        self.peer_state
            .iter()
            .filter(|(_, peer)| peer.is_voting())
            .max_by(|(a_id, a), (b_id, b)| a.matched().cmp(&b.matched()).then_with(|| b_id.cmp(a_id)))
            .map(|(peer_id, _)| peer_id.clone())
    }

    /// Matched indexes of voting peers only. Non-voting members never hold up a commit.
    pub(crate) fn voting_peers_matched(&self) -> Vec<Option<Index>> {
        self.peer_state
            .values()
            .filter(|peer| peer.voting)
            .map(|peer| peer.matched)
            .collect()
    }

    pub(crate) fn quorum_active(&self) -> bool {
        self.quorum_active
    }

    /// Re-evaluates whether we heard from enough voting peers within `window`. Returns the new
    /// value when it flipped.
    pub(crate) fn refresh_quorum_active(&mut self, now: Instant, window: Duration, i_am_voting: bool) -> Option<bool> {
        let num_voting_peers = self.peer_state.values().filter(|peer| peer.voting).count();
        // A voting leader counts itself towards the majority.
        let needed = if i_am_voting {
            majority(num_voting_peers + 1) - 1
        } else {
            majority(num_voting_peers)
        };
        let heard_from = self
            .peer_state
            .values()
            .filter(|peer| peer.voting && now.saturating_duration_since(peer.last_contact) <= window)
            .count();

        let quorum_active = heard_from >= needed;
        if quorum_active == self.quorum_active {
            None
        } else {
            self.quorum_active = quorum_active;
            Some(quorum_active)
        }
    }
}

/// A snapshot being streamed to one peer. Holding the stream ref keeps the spilled snapshot alive.
pub(crate) struct SnapshotTransfer {
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
    pub(crate) configuration: Option<ServerConfiguration>,
    pub(crate) data: SharedStreamRef,
    pub(crate) size: u64,
    pub(crate) offset: u64,
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: HeartbeatTimerHandle,
    voting: bool,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // Logical clock over this leader's requests to the peer. Only one request is outstanding at a
    // time, and replies carrying an older seq-no than one already seen are dropped.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    // Any reply at all counts, including rejections. Used for isolated-leader detection.
    last_contact: Instant,

    snapshot_transfer: Option<SnapshotTransfer>,
}

impl PeerState {
    pub(super) fn new(
        heartbeat_timer: HeartbeatTimerHandle,
        voting: bool,
        previous_log_entry_index: Option<Index>,
        now: Instant,
    ) -> Self {
        PeerState {
            heartbeat_timer,
            voting,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            last_contact: now,
            snapshot_transfer: None,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn is_voting(&self) -> bool {
        self.voting
    }

    pub(super) fn set_voting(&mut self, voting: bool) {
        self.voting = voting;
    }

    pub(crate) fn snapshot_transfer(&self) -> Option<&SnapshotTransfer> {
        self.snapshot_transfer.as_ref()
    }

    pub(crate) fn start_snapshot_transfer(&mut self, transfer: SnapshotTransfer) {
        self.snapshot_transfer = Some(transfer);
    }

    /// Gives up on the current transfer. The next attempt starts over from the latest snapshot.
    pub(crate) fn abort_snapshot_transfer(&mut self) {
        self.snapshot_transfer = None;
    }

    pub(crate) fn record_contact(&mut self, now: Instant) {
        if now > self.last_contact {
            self.last_contact = now;
        }
    }

    /// Applies a reply. Returns false if the reply was out of order and got dropped.
    pub(crate) fn handle_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) -> bool {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.update_log(previous_log_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.rewind_log(logger, last_log_index);
            }
            PeerStateUpdate::SnapshotChunkAccepted { next_offset } => {
                if let Some(transfer) = self.snapshot_transfer.as_mut() {
                    transfer.offset = next_offset;
                }
            }
            PeerStateUpdate::SnapshotOffsetMismatch { expected_offset } => {
                if let Some(transfer) = self.snapshot_transfer.as_mut() {
                    slog::info!(
                        logger,
                        "Peer expects snapshot offset {} instead of {}",
                        expected_offset,
                        transfer.offset
                    );
                    transfer.offset = expected_offset;
                }
            }
            PeerStateUpdate::SnapshotInstalled => {
                if let Some(transfer) = self.snapshot_transfer.take() {
                    self.ratchet_fwd_matched(transfer.last_included_index);
                }
            }
        }
        true
    }

    fn update_log(&mut self, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            // Heartbeat against an empty log, nothing learned.
            (None, 0) => return,
            (None, n) => Index::new(n as u64),
            (Some(prev), n) => prev.plus(n as u64),
        };
        self.ratchet_fwd_matched(new_matched);
    }

    fn ratchet_fwd_matched(&mut self, new_matched: Index) {
        if matches!(self.matched, Some(matched) if matched >= new_matched) {
            return;
        }

        self.matched = Some(new_matched);
        if self.next <= new_matched {
            self.next = new_matched.plus(1);
        }
    }

    /// Steps `next` back using the peer's last index as a hint, so a far-behind peer doesn't cost
    /// one round trip per missing entry.
    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        // Don't panic here, because peer could return garbage data.
        if let Some(matched) = self.matched {
            if self.next.checked_minus(1) <= Some(matched) {
                slog::warn!(
                    logger,
                    "Illegal state: Peer claims to miss entries at or before matched index {:?}. Not mutating state.",
                    matched
                );
                return;
            }
        }

        let stepped_back = match self.next.checked_minus(1) {
            Some(stepped_back) => stepped_back,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };
        let hinted = peer_last_log_index
            .map(|last| last.plus(1))
            .unwrap_or_else(Index::start_index);

        let mut new_next = std::cmp::min(stepped_back, hinted);
        if let Some(matched) = self.matched {
            new_next = std::cmp::max(new_next, matched.plus(1));
        }
        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    SnapshotChunkAccepted {
        next_offset: u64,
    },
    SnapshotOffsetMismatch {
        expected_offset: u64,
    },
    SnapshotInstalled,
    OtherError,
}
