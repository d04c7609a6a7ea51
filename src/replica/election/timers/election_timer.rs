use crate::actor;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::wake_slot::WakeSlot;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// Held by followers and candidates. Dropping the handle stops the timer task without firing.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    next_wake_time: WakeSlot,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_wake_time: WakeSlot,
    actor_client: actor::WeakActorClient,
    clock: C,
    // Pause between repeated timeouts when the replica keeps failing to elect anyone.
    retry_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    /// Pushes the election back by a fresh random timeout. Called on every valid leader contact.
    pub(crate) fn reset_timeout(&self) {
        self.shared.reset_timeout();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_timeout(&self) {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.next_wake_time.set(self.clock.now() + rand_timeout);
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let next_wake_time = WakeSlot::default();
        let shared = Arc::new(Shared {
            next_wake_time: next_wake_time.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });

        // The slot must hold a deadline before the task starts, or it fires right away.
        shared.reset_timeout();

        let task = ElectionTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_wake_time,
            actor_client,
            clock,
            retry_backoff: min_timeout,
        };

        (task, ElectionTimerHandle { shared })
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => {
                    if self.handle_dropped() {
                        return;
                    }
                    // Nobody reset us while we slept. The replica decides whether this still
                    // warrants an election; it may have heard from a leader concurrently.
                    if self.actor_client.election_timeout().await.is_err() {
                        return;
                    }
                    let backoff = self.retry_backoff;
                    self.clock.sleep(backoff).await;
                }
            }

            if self.handle_dropped() {
                return;
            }
        }
    }

    fn handle_dropped(&self) -> bool {
        self.weak_shared.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock;
    use crate::replica::election::timers::test_utils::TestUtilActor;

    #[tokio::test]
    async fn reset_postpones_timeout() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        // Fixed range, jitter is not under test.
        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());
        actor.assert_no_event().await;

        for _ in 0..5 {
            mock_clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
        assert_eq!(mock_clock_controller.elapsed_time(), timeout * 5 / 2);

        // Last reset happened at T=2.5, so nothing before T=3.5.
        let one_ns = Duration::from_nanos(1);
        mock_clock_controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        mock_clock_controller.advance(one_ns);
        actor.assert_election_timeout_event().await;
    }

    #[tokio::test]
    async fn keeps_firing_after_backoff_until_reset() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());

        mock_clock_controller.advance(timeout);
        actor.assert_election_timeout_event().await;

        // Candidate retry: another timeout one backoff later.
        mock_clock_controller.advance(timeout);
        actor.assert_election_timeout_event().await;

        // A reset racing with a timeout must not kill the task.
        for _ in 0..5 {
            mock_clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn dropped_handle_stops_task() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        let join_handle = tokio::task::spawn(timer_task.run());
        drop(timer_handle);

        mock_clock_controller.advance(timeout * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }
}
