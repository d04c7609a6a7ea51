//! Snapshot capture, compression, and persistence.
mod capture;
mod store;

pub(crate) use capture::load_into_spill_stream;
pub(crate) use capture::restore_snapshot;
pub(crate) use capture::spawn_capture;
pub(crate) use capture::CapturePoint;
pub(crate) use capture::SnapshotIoConfig;
pub(crate) use store::FileSnapshotStore;
pub(crate) use store::InMemorySnapshotStore;
pub(crate) use store::SnapshotMeta;
pub(crate) use store::SnapshotStore;
