use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// WakeSlot is written by a timer handle and drained by its timer task. An empty slot after
/// sleeping means nobody pushed the deadline back in the meantime.
#[derive(Clone, Default)]
pub(super) struct WakeSlot {
    next_wake_time: Arc<Mutex<Option<Instant>>>,
}

impl WakeSlot {
    pub(super) fn set(&self, wake_time: Instant) {
        self.next_wake_time
            .lock()
            .expect("WakeSlot.set() mutex guard poison")
            .replace(wake_time);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.next_wake_time
            .lock()
            .expect("WakeSlot.take() mutex guard poison")
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn take_drains_latest() {
        let slot = WakeSlot::default();
        let writer = slot.clone();
        let now = Instant::now();

        assert_eq!(slot.take(), None);
        writer.set(now);
        writer.set(now + Duration::from_millis(5));
        assert_eq!(slot.take(), Some(now + Duration::from_millis(5)));
        assert_eq!(slot.take(), None);
    }
}
