use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempPath;

const TEMP_FILE_PREFIX: &str = "FileBackedOutputStream";

/// FileBackedOutputStream buffers writes in memory until the cumulative size would exceed
/// `threshold`, at which point everything written so far (and everything after) moves to a
/// temporary file. The transition happens at most once.
///
/// The first call to `as_byte_source()` freezes the stream. Subsequent writes fail, and every
/// `ByteSource` handed out reads the same bytes.
pub struct FileBackedOutputStream {
    threshold: usize,
    directory: Option<PathBuf>,
    backing: Backing,
    count: u64,
    frozen: Option<ByteSource>,
}

enum Backing {
    Memory(Vec<u8>),
    File {
        // None once frozen.
        writer: Option<BufWriter<File>>,
        path: TempPath,
    },
}

impl FileBackedOutputStream {
    /// `directory` is where the temp file will be created. `None` means the OS temp dir.
    pub fn new(threshold: usize, directory: Option<PathBuf>) -> Self {
        FileBackedOutputStream {
            threshold,
            directory,
            backing: Backing::Memory(Vec::new()),
            count: 0,
            frozen: None,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Freezes the stream and returns a re-readable view of everything written.
    pub fn as_byte_source(&mut self) -> io::Result<ByteSource> {
        if let Some(source) = &self.frozen {
            return Ok(source.clone());
        }

        let source = match &mut self.backing {
            Backing::Memory(buffer) => ByteSource::from_bytes(Bytes::from(mem::take(buffer))),
            Backing::File { writer, path } => {
                if let Some(mut w) = writer.take() {
                    w.flush()?;
                    w.get_ref().sync_data()?;
                }
                ByteSource::from_file(path.to_path_buf(), self.count)
            }
        };

        self.frozen = Some(source.clone());
        Ok(source)
    }

    /// Deletes the temp file (if any) and resets to an empty, writable stream.
    pub fn cleanup(&mut self) -> io::Result<()> {
        self.frozen = None;
        self.count = 0;

        match mem::replace(&mut self.backing, Backing::Memory(Vec::new())) {
            Backing::Memory(_) => Ok(()),
            Backing::File { writer, path } => {
                drop(writer);
                path.close()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn temp_file_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(&**path),
        }
    }

    fn spill_to_file(&mut self) -> io::Result<()> {
        let temp_file = match &self.directory {
            Some(dir) => tempfile::Builder::new().prefix(TEMP_FILE_PREFIX).tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix(TEMP_FILE_PREFIX).tempfile()?,
        };
        let (file, path) = temp_file.into_parts();
        let mut writer = BufWriter::new(file);

        if let Backing::Memory(buffer) = &self.backing {
            writer.write_all(buffer)?;
        }

        self.backing = Backing::File {
            writer: Some(writer),
            path,
        };
        Ok(())
    }
}

impl Write for FileBackedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.frozen.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "Stream has already been read and can no longer be written to",
            ));
        }

        if let Backing::Memory(buffer) = &self.backing {
            if buffer.len() + buf.len() > self.threshold {
                self.spill_to_file()?;
            }
        }

        match &mut self.backing {
            Backing::Memory(buffer) => buffer.extend_from_slice(buf),
            Backing::File { writer: Some(w), .. } => w.write_all(buf)?,
            Backing::File { writer: None, .. } => {
                return Err(io::Error::new(io::ErrorKind::Other, "Temp file writer already closed"));
            }
        }

        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::File { writer: Some(w), .. } => w.flush(),
            _ => Ok(()),
        }
    }
}

/// ByteSource is a re-readable view of bytes that live either in memory or in a file. Every
/// `open_stream()` starts from the beginning.
#[derive(Clone, Debug)]
pub struct ByteSource {
    backing: SourceBacking,
}

#[derive(Clone, Debug)]
enum SourceBacking {
    Memory(Bytes),
    File { path: PathBuf, size: u64 },
}

impl ByteSource {
    pub fn from_bytes(bytes: Bytes) -> Self {
        ByteSource {
            backing: SourceBacking::Memory(bytes),
        }
    }

    pub fn from_file(path: PathBuf, size: u64) -> Self {
        ByteSource {
            backing: SourceBacking::File { path, size },
        }
    }

    pub fn size(&self) -> u64 {
        match &self.backing {
            SourceBacking::Memory(bytes) => bytes.len() as u64,
            SourceBacking::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn open_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.backing {
            SourceBacking::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            SourceBacking::File { path, .. } => Ok(Box::new(io::BufReader::new(File::open(path)?))),
        }
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size() as usize);
        self.open_stream()?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads up to `len` bytes starting at `offset`. Returns fewer bytes at the end of the source.
    pub fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let size = self.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = std::cmp::min(len as u64, size - offset) as usize;

        match &self.backing {
            SourceBacking::Memory(bytes) => {
                let start = offset as usize;
                Ok(bytes[start..start + len].to_vec())
            }
            SourceBacking::File { path, .. } => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn copy_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<u64> {
        let mut reader = self.open_stream()?;
        io::copy(&mut reader, out)
    }
}

/// SharedFileBackedOutputStream is a `FileBackedOutputStream` with reference-counted cleanup, so
/// one spilled payload can be read by several consumers. The usage count starts at 1. The temp
/// file is deleted, and the cleanup callback (if any) fires, when the count drops to zero.
#[derive(Clone)]
pub struct SharedFileBackedOutputStream {
    shared: Arc<Mutex<SharedState>>,
}

struct SharedState {
    stream: FileBackedOutputStream,
    usage_count: usize,
    on_cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl SharedFileBackedOutputStream {
    pub fn new(threshold: usize, directory: Option<PathBuf>) -> Self {
        SharedFileBackedOutputStream {
            shared: Arc::new(Mutex::new(SharedState {
                stream: FileBackedOutputStream::new(threshold, directory),
                usage_count: 1,
                on_cleanup: None,
            })),
        }
    }

    pub fn set_on_cleanup_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().on_cleanup = Some(Box::new(callback));
    }

    pub fn increment_usage_count(&self) {
        self.lock().usage_count += 1;
    }

    pub fn usage_count(&self) -> usize {
        self.lock().usage_count
    }

    /// Releases one usage. The last release deletes the temp file and runs the callback, which
    /// fires even when the delete fails.
    pub fn cleanup(&self) -> io::Result<()> {
        let (deleted, callback) = {
            let mut state = self.lock();
            if state.usage_count == 0 {
                return Ok(());
            }
            state.usage_count -= 1;
            if state.usage_count > 0 {
                return Ok(());
            }

            let callback = state.on_cleanup.take();
            (state.stream.cleanup(), callback)
        };

        // Run outside the lock; the callback may touch this stream.
        if let Some(callback) = callback {
            callback();
        }
        deleted
    }

    pub fn as_byte_source(&self) -> io::Result<ByteSource> {
        self.lock().stream.as_byte_source()
    }

    pub fn count(&self) -> u64 {
        self.lock().stream.count()
    }

    /// Acquires a usage that is released when the returned guard drops.
    pub fn acquire(&self) -> SharedStreamRef {
        self.increment_usage_count();
        SharedStreamRef { stream: self.clone() }
    }

    #[cfg(test)]
    pub(crate) fn temp_file_path(&self) -> Option<PathBuf> {
        self.lock().stream.temp_file_path().map(Path::to_path_buf)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared
            .lock()
            .expect("SharedFileBackedOutputStream mutex guard poison")
    }
}

impl fmt::Debug for SharedFileBackedOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SharedFileBackedOutputStream")
            .field("count", &state.stream.count())
            .field("usage_count", &state.usage_count)
            .finish()
    }
}

impl Write for SharedFileBackedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().stream.flush()
    }
}

/// SharedStreamRef holds one usage of a `SharedFileBackedOutputStream`.
pub struct SharedStreamRef {
    stream: SharedFileBackedOutputStream,
}

impl SharedStreamRef {
    pub fn as_byte_source(&self) -> io::Result<ByteSource> {
        self.stream.as_byte_source()
    }
}

impl Drop for SharedStreamRef {
    fn drop(&mut self) {
        // Nothing useful to do with a failed delete here; the OS temp dir is reaped eventually.
        let _ = self.stream.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn below_threshold_never_creates_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = FileBackedOutputStream::new(10, Some(dir.path().to_path_buf()));

        stream.write_all(b"0123456789").unwrap();
        assert!(stream.temp_file_path().is_none());
        assert_eq!(files_in(dir.path()), 0);

        let source = stream.as_byte_source().unwrap();
        assert_eq!(source.read().unwrap(), b"0123456789".to_vec());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn above_threshold_creates_exactly_one_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = FileBackedOutputStream::new(10, Some(dir.path().to_path_buf()));

        stream.write_all(b"0123456789").unwrap();
        stream.write_all(b"abc").unwrap();
        assert!(stream.temp_file_path().is_some());
        stream.write_all(b"defghijklmnop").unwrap();
        assert_eq!(files_in(dir.path()), 1);

        let source = stream.as_byte_source().unwrap();
        assert_eq!(source.size(), 26);
        assert_eq!(source.read().unwrap(), b"0123456789abcdefghijklmnop".to_vec());
        // Re-readable
        assert_eq!(source.read().unwrap(), b"0123456789abcdefghijklmnop".to_vec());
        assert_eq!(source.read_range(10, 3).unwrap(), b"abc".to_vec());
        assert_eq!(source.read_range(24, 100).unwrap(), b"op".to_vec());

        stream.cleanup().unwrap();
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn write_after_read_fails() {
        let mut stream = FileBackedOutputStream::new(10, None);
        stream.write_all(b"abc").unwrap();
        stream.as_byte_source().unwrap();

        let err = stream.write_all(b"d").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn shared_stream_deletes_file_on_last_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = SharedFileBackedOutputStream::new(4, Some(dir.path().to_path_buf()));
        let callbacks = Arc::new(AtomicUsize::new(0));
        let callbacks_clone = callbacks.clone();
        stream.set_on_cleanup_callback(move || {
            callbacks_clone.fetch_add(1, Ordering::SeqCst);
        });

        stream.write_all(b"more than four bytes").unwrap();
        let path = stream.temp_file_path().unwrap();
        stream.increment_usage_count();
        stream.increment_usage_count();
        assert_eq!(stream.usage_count(), 3);

        stream.cleanup().unwrap();
        stream.cleanup().unwrap();
        assert!(path.exists());
        assert_eq!(callbacks.load(Ordering::SeqCst), 0);

        stream.cleanup().unwrap();
        assert!(!path.exists());
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        // Extra cleanups are ignored and never re-fire the callback.
        stream.cleanup().unwrap();
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_fires_when_delete_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = SharedFileBackedOutputStream::new(4, Some(dir.path().to_path_buf()));
        let callbacks = Arc::new(AtomicUsize::new(0));
        let callbacks_clone = callbacks.clone();
        stream.set_on_cleanup_callback(move || {
            callbacks_clone.fetch_add(1, Ordering::SeqCst);
        });

        stream.write_all(b"more than four bytes").unwrap();
        std::fs::remove_file(stream.temp_file_path().unwrap()).unwrap();

        assert!(stream.cleanup().is_err());
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert_eq!(stream.usage_count(), 0);
    }

    #[test]
    fn shared_stream_ref_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = SharedFileBackedOutputStream::new(4, Some(dir.path().to_path_buf()));
        stream.write_all(b"spilled payload").unwrap();
        let source = stream.as_byte_source().unwrap();

        let reader_ref = stream.acquire();
        assert_eq!(stream.usage_count(), 2);
        stream.cleanup().unwrap();
        assert_eq!(reader_ref.as_byte_source().unwrap().read().unwrap(), b"spilled payload".to_vec());
        assert_eq!(source.size(), 15);

        drop(reader_ref);
        assert_eq!(stream.usage_count(), 0);
        assert_eq!(files_in(dir.path()), 0);
    }
}
