use crate::commitlog::{Entry, Index, Log};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE_NAME: &str = "journal.log";

const JOURNAL_MAGIC: &[u8; 4] = b"SRJ1";
const HEADER_LEN: u64 = 4 + 8;
const RECORD_OVERHEAD: u64 = 4 + 4 + 8;

#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    #[error("IO error")]
    Io(#[from] io::Error),

    #[error("Journal {path:?} is corrupted at byte {offset}: {reason}")]
    Corrupted { path: PathBuf, offset: u64, reason: String },
}

/// FileJournal is a single-file durable log.
///
/// ```text
/// Header:
/// +---+---+---+---+---+---+---+---+---+---+---+---+
/// | S | R | J | 1 |   First index (8 bytes)       |
/// +---+---+---+---+-------------------------------+
///
/// Record:
/// +---------------+---------------+---------------+-----------------...-+
/// | Len (4 bytes) | CRC (4 bytes) | Index (8 b.)  | Payload (Len bytes) |
/// +---------------+---------------+---------------+-----------------...-+
/// ```
///
/// * `CRC` - crc32 of the index and payload
/// * `Index` - must be `First index` for the first record and increase by one per record
///
/// Retained entries are also kept in memory, so reads never touch disk. Any checksum or sequence
/// error found while opening is fatal.
pub struct FileJournal<E: Entry> {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: VecDeque<Vec<u8>>,
    // File offset of each record in `entries`.
    offsets: VecDeque<u64>,
    first: u64,
    end_offset: u64,
    data_size: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileJournal<E> {
    pub fn open(directory: &Path) -> Result<Self, JournalError> {
        fs::create_dir_all(directory)?;
        let path = directory.join(JOURNAL_FILE_NAME);

        if !path.exists() {
            write_journal_file(&path, 1, std::iter::empty::<(u64, &[u8])>())?;
        }

        let (first, entries, offsets, end_offset) = load(&path)?;
        let data_size = entries.iter().map(|e| e.len() as u64).sum();

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(end_offset))?;

        Ok(FileJournal {
            path,
            writer: BufWriter::new(file),
            entries,
            offsets,
            first,
            end_offset,
            data_size,
            _pd: PhantomData::default(),
        })
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

    fn reopen_writer(&mut self) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(self.end_offset))?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Cuts the file back to `end_offset` after a failed append. The old writer is dropped first,
    /// since dropping it may still flush buffered bytes.
    fn discard_partial_write(&mut self) -> io::Result<()> {
        self.reopen_writer()?;
        self.writer.get_ref().set_len(self.end_offset)?;
        self.writer.get_ref().sync_all()
    }
}

impl<E: Entry> Log<E> for FileJournal<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.first + self.entries.len() as u64;
        let payload: Vec<u8> = entry.into();

        let written = write_record(&mut self.writer, index, &payload)
            .and_then(|_| self.writer.flush())
            .and_then(|_| self.writer.get_ref().sync_data());
        if let Err(e) = written {
            // The record is lost either way. A tail that can't be cut off is reported instead,
            // since it would misalign every later record.
            self.discard_partial_write()?;
            return Err(e);
        }

        self.offsets.push_back(self.end_offset);
        self.end_offset += RECORD_OVERHEAD + payload.len() as u64;
        self.data_size += payload.len() as u64;
        self.entries.push_back(payload);

        Ok(Index::new(index))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.offset(index) {
            Some(offset) => E::try_from(self.entries[offset].clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let keep = index.as_u64().saturating_sub(self.first) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }

        let new_end = self.offsets[keep];
        self.writer.flush()?;
        self.writer.get_ref().set_len(new_end)?;
        self.writer.get_ref().sync_all()?;

        while self.entries.len() > keep {
            self.offsets.pop_back();
            if let Some(removed) = self.entries.pop_back() {
                self.data_size -= removed.len() as u64;
            }
        }
        self.end_offset = new_end;
        self.reopen_writer()
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        if through.as_u64() < self.first {
            return Ok(());
        }

        let drop_count = ((through.as_u64() - self.first + 1) as usize).min(self.entries.len());
        let new_first = if drop_count == self.entries.len() {
            through.as_u64() + 1
        } else {
            self.first + drop_count as u64
        };

        // Rewrite the retained suffix under a new header, then atomically swap it in.
        let retained = self
            .entries
            .iter()
            .skip(drop_count)
            .enumerate()
            .map(|(i, payload)| (new_first + i as u64, payload.as_slice()));
        self.writer.flush()?;
        write_journal_file(&self.path, new_first, retained)?;

        for _ in 0..drop_count {
            self.offsets.pop_front();
            if let Some(removed) = self.entries.pop_front() {
                self.data_size -= removed.len() as u64;
            }
        }
        self.first = new_first;

        let mut offset = HEADER_LEN;
        for (i, payload) in self.entries.iter().enumerate() {
            self.offsets[i] = offset;
            offset += RECORD_OVERHEAD + payload.len() as u64;
        }
        self.end_offset = offset;
        self.reopen_writer()
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

fn checksum(index: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&index.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn write_record<W: Write>(writer: &mut W, index: u64, payload: &[u8]) -> io::Result<()> {
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_u32::<BigEndian>(checksum(index, payload))?;
    writer.write_u64::<BigEndian>(index)?;
    writer.write_all(payload)
}

/// Writes a complete journal to a temp file next to `path`, syncs it, and renames it over `path`.
fn write_journal_file<'a, I>(path: &Path, first: u64, records: I) -> io::Result<()>
where
    I: IntoIterator<Item = (u64, &'a [u8])>,
{
    let tmp_path = path.with_extension("log.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_u64::<BigEndian>(first)?;
        for (index, payload) in records {
            write_record(&mut writer, index, payload)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        // Persist the rename itself. Not all platforms allow opening a directory.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

type Loaded = (u64, VecDeque<Vec<u8>>, VecDeque<u64>, u64);

fn load(path: &Path) -> Result<Loaded, JournalError> {
    let corrupted = |offset: u64, reason: &str| JournalError::Corrupted {
        path: path.to_path_buf(),
        offset,
        reason: reason.to_string(),
    };

    let file_len = fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| corrupted(0, "missing header"))?;
    if &magic != JOURNAL_MAGIC {
        return Err(corrupted(0, "bad magic"));
    }
    let first = reader
        .read_u64::<BigEndian>()
        .map_err(|_| corrupted(4, "missing first index"))?;
    if first == 0 {
        return Err(corrupted(4, "first index is zero"));
    }

    let mut entries = VecDeque::new();
    let mut offsets = VecDeque::new();
    let mut offset = HEADER_LEN;

    while offset < file_len {
        if file_len - offset < RECORD_OVERHEAD {
            return Err(corrupted(offset, "truncated record header"));
        }
        let len = reader.read_u32::<BigEndian>()? as u64;
        let crc = reader.read_u32::<BigEndian>()?;
        let index = reader.read_u64::<BigEndian>()?;

        let expected_index = first + entries.len() as u64;
        if index != expected_index {
            return Err(corrupted(
                offset,
                &format!("expected index {} but found {}", expected_index, index),
            ));
        }
        if file_len - offset - RECORD_OVERHEAD < len {
            return Err(corrupted(offset, "truncated record payload"));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if checksum(index, &payload) != crc {
            return Err(corrupted(offset, "checksum mismatch"));
        }

        offsets.push_back(offset);
        entries.push_back(payload);
        offset += RECORD_OVERHEAD + len;
    }

    Ok((first, entries, offsets, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::in_memory::test_entry::TestEntry;

    fn entry(b: u8, len: usize) -> TestEntry {
        TestEntry(vec![b; len])
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
            for b in 1..=4 {
                journal.append(entry(b, b as usize)).unwrap();
            }
            journal.truncate(Index::new(4)).unwrap();
        }

        let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
        assert_eq!(journal.first_index(), Index::new(1));
        assert_eq!(journal.next_index(), Index::new(4));
        assert_eq!(journal.read(Index::new(2)).unwrap(), Some(entry(2, 2)));
        assert_eq!(journal.data_size(), 6);

        assert_eq!(journal.append(entry(7, 3)).unwrap(), Index::new(4));
        drop(journal);

        let journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
        assert_eq!(journal.read(Index::new(4)).unwrap(), Some(entry(7, 3)));
    }

    #[test]
    fn compaction_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
            for b in 1..=5 {
                journal.append(entry(b, 2)).unwrap();
            }
            journal.compact(Index::new(3)).unwrap();
            assert_eq!(journal.append(entry(6, 2)).unwrap(), Index::new(6));
        }

        let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
        assert_eq!(journal.first_index(), Index::new(4));
        assert_eq!(journal.next_index(), Index::new(7));
        assert_eq!(journal.read(Index::new(3)).unwrap(), None);
        assert_eq!(journal.read(Index::new(6)).unwrap(), Some(entry(6, 2)));

        journal.compact(Index::new(20)).unwrap();
        drop(journal);

        let journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
        assert_eq!(journal.first_index(), Index::new(21));
        assert_eq!(journal.next_index(), Index::new(21));
    }

    #[test]
    fn corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
            journal.append(entry(1, 8)).unwrap();
            journal.append(entry(2, 8)).unwrap();
        }

        // Flip a payload byte of the second record.
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        match FileJournal::<TestEntry>::open(dir.path()) {
            Err(JournalError::Corrupted { offset, .. }) => {
                assert_eq!(offset, HEADER_LEN + RECORD_OVERHEAD + 8);
            }
            Err(e) => panic!("Unexpected error {:?}", e),
            Ok(_) => panic!("Corrupted journal opened"),
        }
    }

    #[test]
    fn discarded_partial_write_keeps_records_aligned() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
            journal.append(entry(1, 4)).unwrap();

            // Half a record header reached the file before the write failed.
            journal.writer.write_all(&[0, 0, 0]).unwrap();
            journal.writer.flush().unwrap();
            journal.discard_partial_write().unwrap();

            assert_eq!(journal.append(entry(2, 4)).unwrap(), Index::new(2));
        }

        let journal = FileJournal::<TestEntry>::open(dir.path()).unwrap();
        assert_eq!(journal.next_index(), Index::new(3));
        assert_eq!(journal.read(Index::new(1)).unwrap(), Some(entry(1, 4)));
        assert_eq!(journal.read(Index::new(2)).unwrap(), Some(entry(2, 4)));
    }
}
