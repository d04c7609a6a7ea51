use crate::replica::ElectionStateChangeListener;
use crate::replica::ElectionStateSnapshot;

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// An event of leader election or timeout. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the next event,
    /// those events will be clobbered into only the most recent event.
    Election(ClusterState),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

/// Who leads the cluster, from this member's point of view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterState {
    pub role: RaftRole,
    pub leader_id: Option<String>,
    pub is_current_node_leader: bool,
    /// False while the leader can't reach a majority of voting members. Writes are rejected then.
    pub is_cluster_leader_active: bool,
}

#[derive(Clone)]
pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
    my_replica_id: String,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener, my_replica_id: String) -> Self {
        RaftEventListener {
            election_state_change_listener,
            my_replica_id,
        }
    }

    /// `next_event()` returns the next event that this local raft replica observes. None once the
    /// replica has exited.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        let my_replica_id = &self.my_replica_id;
        self.election_state_change_listener
            .next()
            .await
            .map(|election_state| RaftEvent::Election(ClusterState::new(election_state, my_replica_id)))
    }

    pub fn cluster_state(&self) -> ClusterState {
        ClusterState::new(self.election_state_change_listener.current(), &self.my_replica_id)
    }
}

// ------- Conversions --------

impl ClusterState {
    pub(crate) fn new(election_state: ElectionStateSnapshot, my_replica_id: &str) -> Self {
        match election_state {
            ElectionStateSnapshot::Leader { quorum_active } => ClusterState {
                role: RaftRole::Leader,
                leader_id: Some(my_replica_id.to_string()),
                is_current_node_leader: true,
                is_cluster_leader_active: quorum_active,
            },
            ElectionStateSnapshot::Candidate => ClusterState {
                role: RaftRole::Candidate,
                leader_id: None,
                is_current_node_leader: false,
                is_cluster_leader_active: false,
            },
            ElectionStateSnapshot::Follower(leader_id) => ClusterState {
                role: RaftRole::Follower,
                leader_id: Some(leader_id.into_inner()),
                is_current_node_leader: false,
                is_cluster_leader_active: true,
            },
            ElectionStateSnapshot::FollowerNoLeader => ClusterState {
                role: RaftRole::Follower,
                leader_id: None,
                is_current_node_leader: false,
                is_cluster_leader_active: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;

    #[test]
    fn isolated_leader_is_inactive() {
        let state = ClusterState::new(ElectionStateSnapshot::Leader { quorum_active: false }, "a");
        assert_eq!(state.leader_id.as_deref(), Some("a"));
        assert!(state.is_current_node_leader);
        assert!(!state.is_cluster_leader_active);

        let state = ClusterState::new(ElectionStateSnapshot::Follower(ReplicaId::new("b")), "a");
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.leader_id.as_deref(), Some("b"));
        assert!(state.is_cluster_leader_active);
    }
}
