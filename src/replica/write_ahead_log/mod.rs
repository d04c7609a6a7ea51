//! Raft-specific facade over the generic commit log: term bookkeeping, the commit index, and
//! applying committed entries.

mod log;
mod log_entry;

pub(crate) use log::to_committed_entry;
pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::EntryKind;
pub(crate) use log_entry::EntryOrigin;
pub(crate) use log_entry::WriteAheadLogEntry;
