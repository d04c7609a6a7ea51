use crate::admission::AveragingProgressTracker;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// AdmissionGate turns the tracker's delay estimate into an admit/reject decision for client
/// writes.
#[derive(Clone)]
pub(crate) struct AdmissionGate {
    tracker: Arc<AveragingProgressTracker>,
    delay_ceiling: Duration,
}

/// A task admitted through the gate. The tracker is told when it drops.
pub(crate) struct AdmittedTask {
    tracker: Arc<AveragingProgressTracker>,
    opened_at: Instant,
    delay: Duration,
}

#[derive(Debug, PartialEq)]
pub(crate) struct Throttled {
    pub(crate) estimated_delay: Duration,
}

impl AdmissionGate {
    pub(crate) fn new(tracker: Arc<AveragingProgressTracker>, delay_ceiling: Duration) -> Self {
        AdmissionGate { tracker, delay_ceiling }
    }

    pub(crate) fn try_admit(&self) -> Result<AdmittedTask, Throttled> {
        let now = Instant::now();
        let delay = self.tracker.open_task(now);

        if delay > self.delay_ceiling {
            self.tracker.cancel_task();
            return Err(Throttled { estimated_delay: delay });
        }

        Ok(AdmittedTask {
            tracker: self.tracker.clone(),
            opened_at: now,
            delay,
        })
    }
}

impl AdmittedTask {
    /// How long the caller should hold the task back before submitting it.
    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for AdmittedTask {
    fn drop(&mut self) {
        self.tracker.close_task(Instant::now(), self.opened_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_above_ceiling_and_releases_slot() {
        let tracker = Arc::new(AveragingProgressTracker::new(1, 4, Duration::from_secs(1)));
        let gate = AdmissionGate::new(tracker.clone(), Duration::from_millis(500));

        let first = gate.try_admit().expect("first task under limit");
        assert_eq!(first.delay(), Duration::from_secs(0));

        let rejected = gate.try_admit().err().expect("second task should be throttled");
        assert_eq!(rejected.estimated_delay, Duration::from_secs(1));
        assert_eq!(tracker.tasks_open(), 1);

        drop(first);
        assert_eq!(tracker.tasks_open(), 0);
    }
}
