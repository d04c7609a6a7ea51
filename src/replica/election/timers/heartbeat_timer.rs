use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::wake_slot::WakeSlot;
use crate::{actor, replica};
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// One per peer while leader. The task ticks the actor whenever `heartbeat_duration` passes
/// without the leader having sent anything to that peer.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: WakeSlot,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: WakeSlot,
    actor_client: actor::WeakActorClient,
    tick: replica::HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Call after sending the peer a request so the next heartbeat is a full interval away.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        self.next_heartbeat_time
            .set(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_heartbeat_time = WakeSlot::default();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: next_heartbeat_time.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time,
            actor_client,
            tick: replica::HeartbeatTick { peer_id, term },
            clock,
        };

        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The slot starts empty, so the first iteration ticks right away. A new leader should
        // announce itself to each peer without waiting a heartbeat interval.
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => {
                    let shared = match self.weak_shared.upgrade() {
                        Some(shared) => shared,
                        // Leadership for this term is over.
                        None => return,
                    };
                    if self.actor_client.heartbeat_tick(self.tick.clone()).await.is_err() {
                        return;
                    }
                    shared.reset_heartbeat_timer();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock;
    use crate::replica::election::timers::test_utils::TestUtilActor;
    use crate::replica::{HeartbeatTick, ReplicaId, Term};

    fn expected_tick() -> HeartbeatTick {
        HeartbeatTick {
            peer_id: ReplicaId::new("peer-2"),
            term: Term::new(7),
        }
    }

    #[tokio::test]
    async fn ticks_eagerly_then_every_interval() {
        let heartbeat = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let tick = expected_tick();
        let (timer_task, timer_handle) = HeartbeatTimerTask::new(
            heartbeat,
            strong_actor_client.weak(),
            tick.peer_id.clone(),
            tick.term,
            mock_clock,
        );
        let join_handle = tokio::task::spawn(timer_task.run());

        actor.assert_heartbeat_event(tick.clone()).await;
        actor.assert_no_event().await;

        for _ in 0..3 {
            mock_clock_controller.advance(heartbeat);
            actor.assert_heartbeat_event(tick.clone()).await;
            actor.assert_no_event().await;
        }

        // A long stall produces a single catch-up tick, not a burst.
        mock_clock_controller.advance(heartbeat * 5);
        actor.assert_heartbeat_event(tick.clone()).await;
        actor.assert_no_event().await;

        drop(timer_handle);
        mock_clock_controller.advance(heartbeat);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn traffic_suppresses_heartbeat() {
        let heartbeat = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let tick = expected_tick();
        let (timer_task, timer_handle) = HeartbeatTimerTask::new(
            heartbeat,
            strong_actor_client.weak(),
            tick.peer_id.clone(),
            tick.term,
            mock_clock,
        );
        tokio::task::spawn(timer_task.run());
        actor.assert_heartbeat_event(tick.clone()).await;

        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat / 2);
            timer_handle.reset_heartbeat_timer();
        }
        actor.assert_no_event().await;

        // Last reset at T=2.5.
        mock_clock_controller.advance(heartbeat / 2);
        actor.assert_no_event().await;
        mock_clock_controller.advance(heartbeat / 2);
        actor.assert_heartbeat_event(tick).await;
        assert_eq!(mock_clock_controller.elapsed_time(), heartbeat * 7 / 2);
    }
}
