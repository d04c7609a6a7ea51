use crate::actor::Event;
use crate::replica::HeartbeatTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stands in for the replica actor and asserts on what the timer tasks post to its queue.
pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    pub(super) async fn assert_heartbeat_event(&mut self, expected: HeartbeatTick) {
        match self.recv().await {
            Event::HeartbeatTick(tick) => assert_eq!(tick, expected),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_election_timeout_event(&mut self) {
        match self.recv().await {
            Event::ElectionTimeout => {}
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        tokio::time::timeout(self.quiet_period, self.rx.recv())
            .await
            .expect_err("Expected no event");
    }

    async fn recv(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected event")
    }
}
