use crate::actor::WeakActorClient;
use crate::api::{ApplyError, SnapshotCohort, StateSnapshot};
use crate::commitlog::Index;
use crate::io::{
    new_compress_writer, new_decompress_reader, ByteSource, ChunkedOutputStream, Lz4BlockSize,
    SharedFileBackedOutputStream,
};
use crate::replica::membership::ServerConfiguration;
use crate::replica::snapshot::{SnapshotMeta, SnapshotStore};
use crate::replica::{SnapshotCaptured, Term};
use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const INITIAL_BUFFER_SIZE: usize = 64 * 1024;

/// How snapshot bytes are buffered and compressed.
#[derive(Clone, Debug)]
pub(crate) struct SnapshotIoConfig {
    pub(crate) max_chunk_size: usize,
    pub(crate) spill_threshold: usize,
    pub(crate) spill_directory: Option<PathBuf>,
    pub(crate) block_size: Lz4BlockSize,
}

impl SnapshotIoConfig {
    pub(crate) fn new_spill_stream(&self) -> SharedFileBackedOutputStream {
        SharedFileBackedOutputStream::new(self.spill_threshold, self.spill_directory.clone())
    }
}

/// Serializes `state` and compresses it into a spillable stream.
pub(crate) fn write_snapshot(state: &dyn StateSnapshot, config: &SnapshotIoConfig) -> io::Result<SharedFileBackedOutputStream> {
    let mut serialized = ChunkedOutputStream::new(INITIAL_BUFFER_SIZE, config.max_chunk_size);
    state.write_to(&mut serialized)?;
    serialized.close();
    let serialized = serialized.into_chunked_byte_array()?;

    let mut compressor = new_compress_writer(config.new_spill_stream(), config.block_size);
    serialized.copy_to(&mut compressor)?;
    compressor.finish()
}

/// Decompresses `data` into the cohort, replacing its state.
pub(crate) fn restore_snapshot<C>(data: &ByteSource, cohort: &mut C) -> Result<(), ApplyError>
where
    C: SnapshotCohort + ?Sized,
{
    let mut reader = new_decompress_reader(data.open_stream()?);
    cohort.apply_snapshot(&mut reader)
}

/// Copies a stored snapshot into a spill stream that can be fanned out to peers.
pub(crate) fn load_into_spill_stream(data: &ByteSource, config: &SnapshotIoConfig) -> io::Result<SharedFileBackedOutputStream> {
    let mut stream = config.new_spill_stream();
    data.copy_to(&mut stream)?;
    Ok(stream)
}

/// The log position a capture stands for, and the membership in effect there.
pub(crate) struct CapturePoint {
    pub(crate) last_included_term: Term,
    pub(crate) last_included_index: Index,
    pub(crate) configuration: Option<ServerConfiguration>,
}

/// Captures and persists a snapshot on a blocking worker, then reports back to the replica task.
pub(crate) fn spawn_capture(
    logger: slog::Logger,
    state: Box<dyn StateSnapshot>,
    point: CapturePoint,
    config: SnapshotIoConfig,
    store: Arc<dyn SnapshotStore>,
    actor_client: WeakActorClient,
) {
    let CapturePoint {
        last_included_term,
        last_included_index,
        configuration,
    } = point;
    let stored_configuration = configuration.clone();
    tokio::task::spawn(async move {
        let capture = tokio::task::spawn_blocking(move || {
            let stream = write_snapshot(state.as_ref(), &config)?;
            let data = stream.as_byte_source()?;
            let meta = SnapshotMeta {
                last_included_term,
                last_included_index,
                size: data.size(),
                created_at: Utc::now(),
                configuration: stored_configuration,
            };
            store.save(&meta, &data)?;
            Ok(stream)
        });

        let result = match capture.await {
            Ok(result) => result,
            Err(join_error) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Snapshot capture task failed: {}", join_error),
            )),
        };
        if let Err(e) = &result {
            slog::error!(logger, "Snapshot capture at {:?} failed: {:?}", last_included_index, e);
        }

        let captured = SnapshotCaptured {
            last_included_term,
            last_included_index,
            configuration,
            result,
        };
        if actor_client.notify_snapshot_captured(captured).await.is_err() {
            slog::debug!(logger, "Replica exited before snapshot capture finished");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    struct Fixed(Vec<u8>);

    impl StateSnapshot for Fixed {
        fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
            sink.write_all(&self.0)
        }
    }

    #[derive(Default)]
    struct Restored(Vec<u8>);

    impl SnapshotCohort for Restored {
        fn capture_state(&self) -> Box<dyn StateSnapshot> {
            Box::new(Fixed(self.0.clone()))
        }

        fn apply_snapshot(&mut self, source: &mut dyn Read) -> Result<(), ApplyError> {
            self.0.clear();
            source.read_to_end(&mut self.0)?;
            Ok(())
        }
    }

    fn config(spill_threshold: usize, directory: &std::path::Path) -> SnapshotIoConfig {
        SnapshotIoConfig {
            max_chunk_size: 1024,
            spill_threshold,
            spill_directory: Some(directory.to_path_buf()),
            block_size: Lz4BlockSize::Max64Kb,
        }
    }

    #[test]
    fn snapshot_survives_compression_and_spill() {
        let dir = tempfile::tempdir().unwrap();
        let state: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        // Tiny threshold forces the compressed bytes into a temp file.
        let stream = write_snapshot(&Fixed(state.clone()), &config(16, dir.path())).unwrap();
        assert!(stream.temp_file_path().is_some());
        let data = stream.as_byte_source().unwrap();

        let mut restored = Restored::default();
        restore_snapshot(&data, &mut restored).unwrap();
        assert_eq!(restored.0, state);

        let copy = load_into_spill_stream(&data, &config(1 << 20, dir.path())).unwrap();
        assert_eq!(copy.as_byte_source().unwrap().read().unwrap(), data.read().unwrap());
        stream.cleanup().unwrap();
    }

    #[test]
    fn garbage_is_rejected() {
        let mut restored = Restored::default();
        let garbage = ByteSource::from_bytes(bytes::Bytes::from_static(b"not an lz4 frame"));
        assert!(restore_snapshot(&garbage, &mut restored).is_err());
    }
}
