use crate::commitlog::Index;
use crate::io::ByteSource;
use crate::replica::membership::ServerConfiguration;
use crate::replica::Term;
use crate::rpc::ProtoSnapshotMeta;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub(crate) const SNAPSHOT_META_FILE_NAME: &str = "snapshot.meta";
const SNAPSHOT_DATA_FILE_PREFIX: &str = "snapshot-";
const SNAPSHOT_DATA_FILE_SUFFIX: &str = ".lz4";
const TMP_SUFFIX: &str = ".tmp";

/// Data files are versioned by their last included index, so a save never overwrites the data
/// that the committed meta points at.
fn data_file_name(index: Index) -> String {
    format!("{}{:020}{}", SNAPSHOT_DATA_FILE_PREFIX, index.as_u64(), SNAPSHOT_DATA_FILE_SUFFIX)
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SnapshotMeta {
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
    /// Size of the compressed snapshot.
    pub(crate) size: u64,
    pub(crate) created_at: DateTime<Utc>,
    /// Membership as of `last_included_index`. None for snapshots written before it was recorded.
    pub(crate) configuration: Option<ServerConfiguration>,
}

pub(crate) struct StoredSnapshot {
    pub(crate) meta: SnapshotMeta,
    pub(crate) data: ByteSource,
}

/// SnapshotStore keeps the single most recent snapshot. Saves may come from a blocking worker
/// while the replica task reads, so implementations synchronize internally.
pub(crate) trait SnapshotStore: Send + Sync {
    /// Returns false, and keeps the stored snapshot, if `meta` isn't newer than what's stored.
    fn save(&self, meta: &SnapshotMeta, data: &ByteSource) -> io::Result<bool>;

    fn load(&self) -> io::Result<Option<StoredSnapshot>>;
}

fn is_newer(stored: &Option<SnapshotMeta>, candidate: &SnapshotMeta) -> bool {
    match stored {
        None => true,
        Some(stored) => candidate.last_included_index > stored.last_included_index,
    }
}

/// FileSnapshotStore writes the data to a file named after its last included index, then
/// commits it by renaming `snapshot.meta` into place. Both go through fsynced temp files. Data
/// files the committed meta doesn't name are leftovers of an interrupted save and are removed.
pub(crate) struct FileSnapshotStore {
    directory: PathBuf,
    latest: Mutex<Option<SnapshotMeta>>,
}

impl FileSnapshotStore {
    pub(crate) fn open(directory: &Path) -> io::Result<Self> {
        let meta_path = directory.join(SNAPSHOT_META_FILE_NAME);
        let latest = if meta_path.exists() {
            let meta = decode_meta(&fs::read(&meta_path)?)?;
            let data_size = fs::metadata(directory.join(data_file_name(meta.last_included_index)))?.len();
            if data_size != meta.size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Snapshot data is {} bytes but its meta records {} bytes",
                        data_size, meta.size
                    ),
                ));
            }
            Some(meta)
        } else {
            None
        };

        let store = FileSnapshotStore {
            directory: directory.to_path_buf(),
            latest: Mutex::new(latest),
        };
        let committed = store.lock().as_ref().map(|meta| data_file_name(meta.last_included_index));
        store.remove_stale_files(committed.as_deref())?;
        Ok(store)
    }

    fn write_atomically<F>(&self, file_name: &str, write: F) -> io::Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let path = self.directory.join(file_name);
        let tmp_path = self.directory.join(format!("{}{}", file_name, TMP_SUFFIX));
        {
            let mut file = File::create(&tmp_path)?;
            write(&mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)
    }

    /// Deletes temp files and every data file other than `committed`.
    fn remove_stale_files(&self, committed: Option<&str>) -> io::Result<()> {
        for dir_entry in fs::read_dir(&self.directory)? {
            let file_name = dir_entry?.file_name();
            let file_name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let is_data = file_name.starts_with(SNAPSHOT_DATA_FILE_PREFIX)
                && (file_name.ends_with(SNAPSHOT_DATA_FILE_SUFFIX) || file_name.ends_with(TMP_SUFFIX));
            let is_meta_tmp = file_name == format!("{}{}", SNAPSHOT_META_FILE_NAME, TMP_SUFFIX);
            if (is_data || is_meta_tmp) && Some(file_name) != committed {
                fs::remove_file(self.directory.join(file_name))?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SnapshotMeta>> {
        self.latest.lock().expect("FileSnapshotStore mutex guard poison")
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, meta: &SnapshotMeta, data: &ByteSource) -> io::Result<bool> {
        let mut latest = self.lock();
        if !is_newer(&latest, meta) {
            return Ok(false);
        }

        let data_file = data_file_name(meta.last_included_index);
        self.write_atomically(&data_file, |file| data.copy_to(file).map(|_| ()))?;
        let encoded = encode_meta(meta)?;
        self.write_atomically(SNAPSHOT_META_FILE_NAME, |file| file.write_all(&encoded))?;
        if let Ok(dir) = File::open(&self.directory) {
            let _ = dir.sync_all();
        }
        *latest = Some(meta.clone());

        // The new snapshot is committed. Failing to clean up the old one is not a save failure.
        let _ = self.remove_stale_files(Some(&data_file));
        Ok(true)
    }

    fn load(&self) -> io::Result<Option<StoredSnapshot>> {
        let latest = self.lock();
        Ok(latest.as_ref().map(|meta| StoredSnapshot {
            meta: meta.clone(),
            data: ByteSource::from_file(self.directory.join(data_file_name(meta.last_included_index)), meta.size),
        }))
    }
}

/// Keeps the snapshot in memory. For members configured without a storage directory.
#[derive(Default)]
pub(crate) struct InMemorySnapshotStore {
    latest: Mutex<Option<(SnapshotMeta, Bytes)>>,
}

impl InMemorySnapshotStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(SnapshotMeta, Bytes)>> {
        self.latest.lock().expect("InMemorySnapshotStore mutex guard poison")
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, meta: &SnapshotMeta, data: &ByteSource) -> io::Result<bool> {
        let mut latest = self.lock();
        let stored_meta = latest.as_ref().map(|(meta, _)| meta.clone());
        if !is_newer(&stored_meta, meta) {
            return Ok(false);
        }

        *latest = Some((meta.clone(), Bytes::from(data.read()?)));
        Ok(true)
    }

    fn load(&self) -> io::Result<Option<StoredSnapshot>> {
        Ok(self.lock().as_ref().map(|(meta, bytes)| StoredSnapshot {
            meta: meta.clone(),
            data: ByteSource::from_bytes(bytes.clone()),
        }))
    }
}

// ------- Conversions --------

fn encode_meta(meta: &SnapshotMeta) -> io::Result<Vec<u8>> {
    let proto = ProtoSnapshotMeta {
        last_included_index: meta.last_included_index.as_u64(),
        last_included_term: meta.last_included_term.as_u64(),
        size: meta.size,
        created_at_millis: meta.created_at.timestamp_millis(),
        servers: meta
            .configuration
            .as_ref()
            .map(ServerConfiguration::to_proto)
            .unwrap_or_default(),
    };
    let mut bytes = Vec::with_capacity(proto.encoded_len());
    proto
        .encode(&mut bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(bytes)
}

fn decode_meta(bytes: &[u8]) -> io::Result<SnapshotMeta> {
    let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidData, reason);

    let proto = ProtoSnapshotMeta::decode(bytes).map_err(|e| invalid(format!("Undecodable snapshot meta: {}", e)))?;
    let last_included_index = Index::from_u64_opt(proto.last_included_index)
        .ok_or_else(|| invalid("Snapshot meta has index 0".to_string()))?;
    let created_at = Utc
        .timestamp_millis_opt(proto.created_at_millis)
        .single()
        .ok_or_else(|| invalid(format!("Snapshot timestamp {} out of range", proto.created_at_millis)))?;

    Ok(SnapshotMeta {
        last_included_term: Term::new(proto.last_included_term),
        last_included_index,
        size: proto.size,
        created_at,
        configuration: ServerConfiguration::from_proto(proto.servers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(index: u64, size: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_included_term: Term::new(2),
            last_included_index: Index::new(index),
            size,
            created_at: Utc.timestamp_millis_opt(1_600_000_000_000).unwrap(),
            configuration: None,
        }
    }

    fn source(bytes: &'static [u8]) -> ByteSource {
        ByteSource::from_bytes(Bytes::from_static(bytes))
    }

    fn exercise_store(store: &dyn SnapshotStore) {
        assert!(store.load().unwrap().is_none());

        assert!(store.save(&meta(10, 3), &source(b"abc")).unwrap());
        // Older or equal snapshots never replace a newer one.
        assert!(!store.save(&meta(10, 3), &source(b"xyz")).unwrap());
        assert!(!store.save(&meta(4, 2), &source(b"zz")).unwrap());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.meta, meta(10, 3));
        assert_eq!(loaded.data.read().unwrap(), b"abc");
    }

    #[test]
    fn in_memory_keeps_newest() {
        exercise_store(&InMemorySnapshotStore::new());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FileSnapshotStore::open(dir.path()).unwrap());

        let reopened = FileSnapshotStore::open(dir.path()).unwrap();
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.meta, meta(10, 3));
        assert_eq!(loaded.data.read().unwrap(), b"abc");
        let file_names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(file_names.len(), 2, "{:?}", file_names);
        assert!(file_names.contains(&data_file_name(Index::new(10))));
    }

    #[test]
    fn newer_save_replaces_old_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        store.save(&meta(10, 3), &source(b"abc")).unwrap();
        store.save(&meta(20, 4), &source(b"wxyz")).unwrap();

        assert!(!dir.path().join(data_file_name(Index::new(10))).exists());
        let loaded = FileSnapshotStore::open(dir.path()).unwrap().load().unwrap().unwrap();
        assert_eq!(loaded.meta, meta(20, 4));
        assert_eq!(loaded.data.read().unwrap(), b"wxyz");
    }

    #[test]
    fn save_interrupted_before_meta_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSnapshotStore::open(dir.path()).unwrap();
            store.save(&meta(10, 3), &source(b"abc")).unwrap();
        }
        // A crash after the new data landed but before its meta was renamed into place.
        fs::write(dir.path().join(data_file_name(Index::new(20))), b"abc").unwrap();
        fs::write(dir.path().join(format!("{}{}", SNAPSHOT_META_FILE_NAME, TMP_SUFFIX)), b"partial").unwrap();

        let reopened = FileSnapshotStore::open(dir.path()).unwrap();
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.meta, meta(10, 3));
        assert_eq!(loaded.data.read().unwrap(), b"abc");
        assert!(!dir.path().join(data_file_name(Index::new(20))).exists());
        assert!(!dir.path().join(format!("{}{}", SNAPSHOT_META_FILE_NAME, TMP_SUFFIX)).exists());

        // The interrupted index can be saved again.
        assert!(reopened.save(&meta(20, 4), &source(b"wxyz")).unwrap());
    }

    #[test]
    fn membership_survives_reopen() {
        use crate::replica::{ReplicaId, ReplicaMetadata};

        let dir = tempfile::tempdir().unwrap();
        let mut with_members = meta(10, 3);
        with_members.configuration = Some(ServerConfiguration::new(vec![
            ReplicaMetadata::new(ReplicaId::new("a"), true),
            ReplicaMetadata::new(ReplicaId::new("b"), false),
        ]));
        FileSnapshotStore::open(dir.path())
            .unwrap()
            .save(&with_members, &source(b"abc"))
            .unwrap();

        let loaded = FileSnapshotStore::open(dir.path()).unwrap().load().unwrap().unwrap();
        assert_eq!(loaded.meta, with_members);
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSnapshotStore::open(dir.path()).unwrap();
            store.save(&meta(10, 3), &source(b"abc")).unwrap();
        }
        fs::write(dir.path().join(data_file_name(Index::new(10))), b"abcdef").unwrap();

        let err = FileSnapshotStore::open(dir.path()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
