use std::cmp;
use std::io;
use std::io::{Read, Write};
use std::mem;

/// ChunkedOutputStream is an append-only byte accumulator. The first chunk starts at the
/// requested initial size (rounded up to a power of two) and doubles until it reaches
/// `max_chunk_size`. After that, each new chunk is allocated at exactly `max_chunk_size`, so large
/// payloads never require one contiguous allocation or a full copy on growth.
pub struct ChunkedOutputStream {
    max_chunk_size: usize,
    full_chunks: Vec<Vec<u8>>,
    current: Vec<u8>,
    // Capacity we've decided on for `current`. Vec may over-allocate, so track it ourselves.
    current_capacity: usize,
    size: usize,
    closed: bool,
}

impl ChunkedOutputStream {
    pub fn new(initial_size: usize, max_chunk_size: usize) -> Self {
        assert!(max_chunk_size > 0, "max_chunk_size must be non-zero");
        let initial_capacity = cmp::min(initial_size.max(1).next_power_of_two(), max_chunk_size);

        ChunkedOutputStream {
            max_chunk_size,
            full_chunks: Vec::new(),
            current: Vec::with_capacity(initial_capacity),
            current_capacity: initial_capacity,
            size: 0,
            closed: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// After `close()`, further writes fail.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn into_chunked_byte_array(mut self) -> io::Result<ChunkedByteArray> {
        if !self.closed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "ChunkedOutputStream must be closed before conversion",
            ));
        }

        if !self.current.is_empty() {
            self.full_chunks.push(mem::take(&mut self.current));
        }

        Ok(ChunkedByteArray {
            chunks: self.full_chunks,
            size: self.size,
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::new(io::ErrorKind::Other, "ChunkedOutputStream is closed"))
        } else {
            Ok(())
        }
    }

    fn next_chunk(&mut self) {
        if self.full_chunks.is_empty() && self.current_capacity < self.max_chunk_size {
            // Still growing the first chunk.
            let new_capacity = cmp::min(self.current_capacity * 2, self.max_chunk_size);
            self.current.reserve_exact(new_capacity - self.current.len());
            self.current_capacity = new_capacity;
        } else {
            let full = mem::replace(&mut self.current, Vec::with_capacity(self.max_chunk_size));
            self.full_chunks.push(full);
            self.current_capacity = self.max_chunk_size;
        }
    }
}

impl Write for ChunkedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;

        let mut remaining = buf;
        while !remaining.is_empty() {
            let space = self.current_capacity - self.current.len();
            if space == 0 {
                self.next_chunk();
                continue;
            }

            let n = cmp::min(space, remaining.len());
            self.current.extend_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
        }

        self.size += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()
    }
}

/// ChunkedByteArray is the immutable result of a closed `ChunkedOutputStream`.
#[derive(Clone, Debug, Default)]
pub struct ChunkedByteArray {
    chunks: Vec<Vec<u8>>,
    size: usize,
}

impl ChunkedByteArray {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn reader(&self) -> ChunkedByteArrayReader<'_> {
        ChunkedByteArrayReader {
            chunks: &self.chunks,
            chunk: 0,
            offset: 0,
        }
    }

    pub fn copy_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        for chunk in self.chunks.iter() {
            out.write_all(chunk)?;
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size);
        for chunk in self.chunks.iter() {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }
}

pub struct ChunkedByteArrayReader<'a> {
    chunks: &'a [Vec<u8>],
    chunk: usize,
    offset: usize,
}

impl Read for ChunkedByteArrayReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk < self.chunks.len() {
            let current = &self.chunks[self.chunk];
            if self.offset < current.len() {
                let n = cmp::min(buf.len(), current.len() - self.offset);
                buf[..n].copy_from_slice(&current[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.chunk += 1;
            self.offset = 0;
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL_SIZE: usize = 256;
    const MAX_CHUNK_SIZE: usize = 4096;

    fn write_sequence(size: usize) -> ChunkedByteArray {
        let mut stream = ChunkedOutputStream::new(INITIAL_SIZE, MAX_CHUNK_SIZE);
        for i in 0..size {
            stream.write_all(&[i as u8]).unwrap();
        }
        stream.close();
        stream.into_chunked_byte_array().unwrap()
    }

    fn assert_sequence(array: &ChunkedByteArray, size: usize) {
        assert_eq!(array.size(), size);
        let mut bytes = Vec::new();
        array.reader().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), size);
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(*b, i as u8, "byte {} differs", i);
        }
    }

    #[test]
    fn single_chunk_at_initial_size() {
        let array = write_sequence(INITIAL_SIZE);
        assert_eq!(array.chunks().len(), 1);
        assert_sequence(&array, INITIAL_SIZE);
    }

    #[test]
    fn first_chunk_grows_by_doubling() {
        let array = write_sequence(INITIAL_SIZE * 2);
        assert_eq!(array.chunks().len(), 1);
        assert_eq!(array.chunks()[0].len(), INITIAL_SIZE * 2);
        assert_sequence(&array, INITIAL_SIZE * 2);
    }

    #[test]
    fn spills_into_second_chunk_past_max() {
        let array = write_sequence(MAX_CHUNK_SIZE + 1);
        assert_eq!(array.chunks().len(), 2);
        assert_eq!(array.chunks()[0].len(), MAX_CHUNK_SIZE);
        assert_eq!(array.chunks()[1].len(), 1);
        assert_sequence(&array, MAX_CHUNK_SIZE + 1);
    }

    #[test]
    fn bulk_write_matches_bytewise_write() {
        let data: Vec<u8> = (0..(MAX_CHUNK_SIZE * 3 + 17)).map(|i| i as u8).collect();
        let mut stream = ChunkedOutputStream::new(INITIAL_SIZE, MAX_CHUNK_SIZE);
        stream.write_all(&data).unwrap();
        stream.close();

        let array = stream.into_chunked_byte_array().unwrap();
        assert_eq!(array.chunks().len(), 4);
        assert_eq!(array.to_vec(), data);
    }

    #[test]
    fn write_after_close_fails() {
        let mut stream = ChunkedOutputStream::new(INITIAL_SIZE, MAX_CHUNK_SIZE);
        stream.write_all(b"abc").unwrap();
        stream.close();
        assert!(stream.write_all(b"d").is_err());
    }

    #[test]
    fn conversion_requires_close() {
        let stream = ChunkedOutputStream::new(INITIAL_SIZE, MAX_CHUNK_SIZE);
        assert!(stream.into_chunked_byte_array().is_err());
    }
}
