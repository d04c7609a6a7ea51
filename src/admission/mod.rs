mod gate;
mod progress;

pub use progress::AveragingProgressTracker;

pub(crate) use gate::AdmissionGate;
pub(crate) use gate::Throttled;
