use crate::replica::ReplicaId;
use tokio::sync::watch;

/// Role of the local replica, as last published by the replica task.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    /// `quorum_active` is false while the leader can't reach a majority of voting peers.
    Leader { quorum_active: bool },
    Candidate,
    Follower(ReplicaId),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Skip no-op publishes so listeners only wake for real transitions.
        if *self.snd.borrow() != new_state {
            let _ = self.snd.send(new_state);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next transition. None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_states_are_not_republished() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);

        notifier.notify_new_state(ElectionStateSnapshot::FollowerNoLeader);
        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));

        notifier.notify_new_state(ElectionStateSnapshot::Leader { quorum_active: true });
        notifier.notify_new_state(ElectionStateSnapshot::Leader { quorum_active: false });
        assert_eq!(
            listener.next().await,
            Some(ElectionStateSnapshot::Leader { quorum_active: false })
        );
        assert_eq!(listener.current(), ElectionStateSnapshot::Leader { quorum_active: false });

        drop(notifier);
        assert_eq!(listener.next().await, None);
    }
}
