mod in_memory;
mod journal;
mod log;

pub use in_memory::InMemoryLog;
pub use journal::FileJournal;
pub use journal::JournalError;
pub use journal::JOURNAL_FILE_NAME;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
