#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock lets timer tasks run against real time in production and a hand-cranked time in tests.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let start = Instant::now();
    let (tx, rx) = watch::channel(start);

    (MockClock { now: rx }, MockClockController { now: tx, start })
}

/// Time only moves when the paired controller advances it.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.now.borrow() < deadline {
            if self.now.changed().await.is_err() {
                // Controller is gone, time will never reach the deadline.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    now: watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn current_time(&self) -> Instant {
        *self.now.borrow()
    }

    pub(crate) fn elapsed_time(&self) -> Duration {
        self.current_time() - self.start
    }

    /// Sleepers wake once `now >= deadline`, however far past the deadline a single advance
    /// jumps. Advance in steps smaller than what the test wants to observe.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let new_now = self.current_time() + duration;
        let _ = self.now.send(new_now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_wakes_sleepers_in_order() {
        let tick = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut clock, mut controller) = mocked_clock();
        let start = controller.current_time();

        tokio::spawn(async move {
            let mut next_wake = start;
            loop {
                next_wake += tick;
                clock.sleep_until(next_wake).await;
                if tx.send(next_wake).is_err() {
                    return;
                }
            }
        });

        // Half-tick offset so each advance lands between deadlines.
        controller.advance(tick / 2);
        tokio::time::timeout(tick, rx.recv())
            .await
            .expect_err("Expected timeout");

        controller.advance(tick);
        assert_eq!(rx.recv().await, Some(start + tick));
        tokio::time::timeout(tick, rx.recv())
            .await
            .expect_err("Expected timeout");

        // One big jump releases every deadline it passes.
        controller.advance(tick * 3);
        assert_eq!(rx.recv().await, Some(start + tick * 2));
        assert_eq!(rx.recv().await, Some(start + tick * 3));
        assert_eq!(rx.recv().await, Some(start + tick * 4));

        assert_eq!(controller.elapsed_time(), tick * 9 / 2);
    }
}
