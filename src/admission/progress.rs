use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// AveragingProgressTracker estimates how long a newly opened task will wait before it can make
/// progress, based on how long the last `window` tasks took to close.
///
/// While fewer than `open_limit` tasks are open the estimate is zero. Beyond the limit, each task
/// ahead of the caller is assumed to take the windowed average duration, less the time the oldest
/// of them has already spent since the last close. Before any task has closed,
/// `default_task_duration` stands in for the average.
pub struct AveragingProgressTracker {
    open_limit: usize,
    window: usize,
    default_task_duration: Duration,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    open_tasks: usize,
    recent_durations: VecDeque<Duration>,
    recent_total: Duration,
    last_closed: Option<Instant>,
}

impl AveragingProgressTracker {
    pub fn new(open_limit: usize, window: usize, default_task_duration: Duration) -> Self {
        AveragingProgressTracker {
            open_limit,
            window: window.max(1),
            default_task_duration,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Records the start of a task and returns its estimated isolated delay.
    pub fn open_task(&self, now: Instant) -> Duration {
        let mut state = self.lock();
        let open_before = state.open_tasks;
        state.open_tasks += 1;

        if open_before < self.open_limit {
            return Duration::from_secs(0);
        }

        let average = self.average_duration(&state);
        let tasks_ahead = (open_before - self.open_limit + 1) as u32;
        // Only the task at the head of the line has been running since the last close.
        let head_progress = state
            .last_closed
            .map(|closed| now.saturating_duration_since(closed).min(average))
            .unwrap_or_default();
        (average * tasks_ahead).saturating_sub(head_progress)
    }

    /// Records the completion of a task opened at `opened_at`.
    pub fn close_task(&self, now: Instant, opened_at: Instant) {
        let mut state = self.lock();
        state.open_tasks = state.open_tasks.saturating_sub(1);

        let duration = now.saturating_duration_since(opened_at);
        state.recent_durations.push_back(duration);
        state.recent_total += duration;
        while state.recent_durations.len() > self.window {
            if let Some(evicted) = state.recent_durations.pop_front() {
                state.recent_total -= evicted;
            }
        }
        state.last_closed = Some(now);
    }

    /// Forgets a task that was opened but never ran. It does not count towards the average.
    pub fn cancel_task(&self) {
        let mut state = self.lock();
        state.open_tasks = state.open_tasks.saturating_sub(1);
    }

    pub fn tasks_open(&self) -> usize {
        self.lock().open_tasks
    }

    fn average_duration(&self, state: &TrackerState) -> Duration {
        if state.recent_durations.is_empty() {
            self.default_task_duration
        } else {
            state.recent_total / state.recent_durations.len() as u32
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().expect("AveragingProgressTracker mutex guard poison")
    }
}
