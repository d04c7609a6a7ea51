use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::time::{Duration, Instant};

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    /// Non-voting members never run an election timer.
    pub voting: bool,
    pub heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

/// Who should receive client writes, from this replica's point of view.
#[derive(Debug, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(ReplicaId),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(Self::snapshot_of(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<ReplicaId>) {
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    /// Returns the votes held right after voting for ourselves, which is 1.
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) -> usize {
        let mut cs = CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: ElectionTimerHandle::spawn_timer_task(
                self.config.election_min_timeout,
                self.config.election_max_timeout,
                self.actor_client.clone(),
            ),
        };
        let votes = cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
        votes
    }

    /// `peers` pairs each peer with whether it votes.
    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peers: Vec<(ReplicaId, bool)>,
        previous_log_entry_index: Option<Index>,
    ) {
        let now = Instant::now();
        let mut peer_state = HashMap::with_capacity(peers.len());
        for (peer_id, voting) in peers {
            let state = self.new_peer_state(term, &peer_id, voting, previous_log_entry_index, now);
            peer_state.insert(peer_id, state);
        }

        self.state = State::Leader(LeaderState {
            term,
            tracker: LeaderStateTracker::new(peer_state),
        });
        self.notify_new_state();
    }

    fn new_peer_state(
        &self,
        term: Term,
        peer_id: &ReplicaId,
        voting: bool,
        previous_log_entry_index: Option<Index>,
        now: Instant,
    ) -> PeerState {
        let heartbeat_timer = HeartbeatTimerHandle::spawn_timer_task(
            self.config.heartbeat_duration,
            self.actor_client.clone(),
            peer_id.clone(),
            term,
        );
        PeerState::new(heartbeat_timer, voting, previous_log_entry_index, now)
    }

    pub(crate) fn is_voting(&self) -> bool {
        self.config.voting
    }

    /// Follows a membership change of our own voting status. A follower that stops voting stops
    /// its election timer, and one that starts voting gets a fresh one.
    pub(crate) fn set_voting(&mut self, voting: bool) {
        if self.config.voting == voting {
            return;
        }
        self.config.voting = voting;
        if let State::Follower(fs) = &mut self.state {
            fs.election_timer = FollowerState::election_timer(&self.config, self.actor_client.clone());
        }
    }

    /// Brings the leader's peer set in line with a new membership. New peers start replicating
    /// after `previous_log_entry_index`. No-op unless leader.
    pub(crate) fn sync_leader_peers(&mut self, peers: Vec<(ReplicaId, bool)>, previous_log_entry_index: Option<Index>) {
        let term = match &self.state {
            State::Leader(ls) => ls.term,
            _ => return,
        };
        let now = Instant::now();
        let mut added = HashMap::new();
        for (peer_id, voting) in &peers {
            let known = self
                .leader_state()
                .map(|tracker| tracker.contains_peer(peer_id))
                .unwrap_or(false);
            if !known {
                let state = self.new_peer_state(term, peer_id, *voting, previous_log_entry_index, now);
                added.insert(peer_id.clone(), state);
            }
        }

        if let State::Leader(ls) = &mut self.state {
            let wanted: HashMap<ReplicaId, bool> = peers.into_iter().collect();
            ls.tracker.retain_peers(|peer_id| wanted.contains_key(peer_id));
            for (peer_id, voting) in wanted {
                if let Some(peer) = ls.tracker.peer_state_mut(&peer_id) {
                    peer.set_voting(voting);
                }
            }
            for (peer_id, state) in added {
                ls.tracker.add_peer(peer_id, state);
            }
        }
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::snapshot_of(&self.state)
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Candidate(_) => CurrentLeader::Unknown,
            State::Follower(FollowerState { leader: Some(id), .. }) => CurrentLeader::Other(id.clone()),
            State::Follower(FollowerState { leader: None, .. }) => CurrentLeader::Unknown,
        }
    }

    fn snapshot_of(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(ls) => ElectionStateSnapshot::Leader {
                quorum_active: ls.tracker.quorum_active(),
            },
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => ElectionStateSnapshot::Follower(leader_id.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    /// Republishes after the leader's quorum flag changed.
    pub(crate) fn notify_quorum_change(&self) {
        self.notify_new_state();
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader_id: &ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader_id.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(cs) => write!(f, "Candidate(Votes={})", cs.received_votes_from.len()),
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    term: Term,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    // Fires again if this election doesn't settle, starting the next term.
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    election_timer: Option<ElectionTimerHandle>,
}

impl CandidateState {
    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<ReplicaId>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            election_timer: Self::election_timer(config, actor_client),
        }
    }

    fn election_timer(config: &ElectionConfig, actor_client: WeakActorClient) -> Option<ElectionTimerHandle> {
        if config.voting {
            Some(ElectionTimerHandle::spawn_timer_task(
                config.election_min_timeout,
                config.election_max_timeout,
                actor_client,
            ))
        } else {
            None
        }
    }

    fn reset_timeout(&self) {
        if let Some(timer) = &self.election_timer {
            timer.reset_timeout();
        }
    }
}
