use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps serialized entries in memory. Used for tests and for members configured
/// without a storage directory.
pub struct InMemoryLog<E: Entry> {
    // Entries are held serialized to exercise the same conversion path as the journal.
    entries: VecDeque<Vec<u8>>,
    // Index of entries[0].
    first: u64,
    data_size: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn new() -> Self {
        InMemoryLog {
            entries: VecDeque::new(),
            first: 1,
            data_size: 0,
            _pd: PhantomData::default(),
        }
    }

    fn offset(&self, index: Index) -> Option<usize> {
        let index = index.as_u64();
        if index < self.first {
            return None;
        }
        let offset = (index - self.first) as usize;
        if offset < self.entries.len() {
            Some(offset)
        } else {
            None
        }
    }
}

impl<E: Entry> Default for InMemoryLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let bytes: Vec<u8> = entry.into();
        self.data_size += bytes.len() as u64;
        self.entries.push_back(bytes);

        Ok(Index::new(self.first + self.entries.len() as u64 - 1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.offset(index) {
            Some(offset) => E::try_from(self.entries[offset].clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let keep = index.as_u64().saturating_sub(self.first) as usize;
        while self.entries.len() > keep {
            if let Some(removed) = self.entries.pop_back() {
                self.data_size -= removed.len() as u64;
            }
        }
        Ok(())
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        while self.first <= through.as_u64() {
            match self.entries.pop_front() {
                Some(removed) => self.data_size -= removed.len() as u64,
                None => {
                    self.first = through.as_u64() + 1;
                    return Ok(());
                }
            }
            self.first += 1;
        }
        Ok(())
    }

    fn first_index(&self) -> Index {
        Index::new(self.first)
    }

    fn next_index(&self) -> Index {
        Index::new(self.first + self.entries.len() as u64)
    }

    fn data_size(&self) -> u64 {
        self.data_size
    }
}

#[cfg(test)]
pub(crate) mod test_entry {
    use crate::commitlog::Entry;
    use std::convert::TryFrom;
    use std::io;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_entry::TestEntry;
    use super::*;

    fn entry(b: u8) -> TestEntry {
        TestEntry(vec![b; 4])
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::new();
        for b in 1..=5 {
            assert_eq!(log.append(entry(b)).unwrap(), Index::new(b as u64));
        }
        assert_eq!(log.data_size(), 20);
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.data_size(), 12);

        assert_eq!(log.append(entry(9)).unwrap(), Index::new(4));
    }

    #[test]
    fn compaction_keeps_indexes() {
        let mut log = InMemoryLog::new();
        for b in 1..=5 {
            log.append(entry(b)).unwrap();
        }

        log.compact(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(5)).unwrap(), Some(entry(5)));
        assert_eq!(log.data_size(), 8);
    }

    #[test]
    fn compaction_past_end_restarts_numbering() {
        let mut log = InMemoryLog::new();
        log.append(entry(1)).unwrap();

        log.compact(Index::new(10)).unwrap();
        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(11));
        assert_eq!(log.data_size(), 4);
    }
}
