//! Byte plumbing for snapshots and large payloads: chunked accumulation, spill-to-disk buffers,
//! and LZ4 framing.
mod chunked;
mod file_backed;
mod lz4;

pub use chunked::ChunkedByteArray;
pub use chunked::ChunkedOutputStream;
pub use file_backed::ByteSource;
pub use file_backed::FileBackedOutputStream;
pub use file_backed::SharedFileBackedOutputStream;
pub use file_backed::SharedStreamRef;
pub use lz4::new_compress_writer;
pub use lz4::new_decompress_reader;
pub use lz4::Lz4BlockSize;
pub use lz4::Lz4Writer;
