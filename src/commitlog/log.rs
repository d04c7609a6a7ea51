use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    /// Index 0 means "no entry" on the wire and on disk.
    pub fn from_u64_opt(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Index::new(index))
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Index::from_u64_opt)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. After compaction, the log holds `first_index()..next_index()`.
pub trait Log<E: Entry>: Send {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Compacted or future indexes return None.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes the entry at `index` and everything after it.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes every entry up to and including `through`. Remaining entries keep their indexes.
    /// Compacting past the end empties the log and the next append goes to `through + 1`.
    fn compact(&mut self, through: Index) -> Result<(), io::Error>;

    /// Index of the oldest retained entry. Equal to `next_index()` when the log is empty.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    /// Bytes held by retained entries.
    fn data_size(&self) -> u64;
}

pub trait Entry: Clone + Send + TryFrom<Vec<u8>, Error = io::Error> + Into<Vec<u8>> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let index = Index::new(3);
        assert_eq!(index.plus(2), Index::new(5));
        assert_eq!(index.checked_minus(2), Some(Index::start_index()));
        assert_eq!(index.checked_minus(3), None);
        assert_eq!(index.checked_minus(7), None);
        assert_eq!(Index::from_u64_opt(0), None);
    }
}
