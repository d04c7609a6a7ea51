use lz4_flex::frame::{BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use std::io;
use std::io::{Read, Write};

/// The block sizes LZ4 frames may be written with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Lz4BlockSize {
    Max64Kb,
    Max256Kb,
    Max1Mb,
    Max4Mb,
}

impl Lz4BlockSize {
    pub fn bytes(self) -> usize {
        match self {
            Lz4BlockSize::Max64Kb => 64 * 1024,
            Lz4BlockSize::Max256Kb => 256 * 1024,
            Lz4BlockSize::Max1Mb => 1024 * 1024,
            Lz4BlockSize::Max4Mb => 4 * 1024 * 1024,
        }
    }

    fn frame_block_size(self) -> BlockSize {
        match self {
            Lz4BlockSize::Max64Kb => BlockSize::Max64KB,
            Lz4BlockSize::Max256Kb => BlockSize::Max256KB,
            Lz4BlockSize::Max1Mb => BlockSize::Max1MB,
            Lz4BlockSize::Max4Mb => BlockSize::Max4MB,
        }
    }
}

impl Default for Lz4BlockSize {
    fn default() -> Self {
        Lz4BlockSize::Max256Kb
    }
}

/// Lz4Writer compresses everything written to it into a single LZ4 frame. The frame is only
/// complete after `finish()`.
pub struct Lz4Writer<W: Write> {
    encoder: FrameEncoder<W>,
}

pub fn new_compress_writer<W: Write>(sink: W, block_size: Lz4BlockSize) -> Lz4Writer<W> {
    let frame_info = FrameInfo::new().block_size(block_size.frame_block_size());
    Lz4Writer {
        encoder: FrameEncoder::with_frame_info(frame_info, sink),
    }
}

pub fn new_decompress_reader<R: Read>(source: R) -> FrameDecoder<R> {
    FrameDecoder::new(source)
}

impl<W: Write> Lz4Writer<W> {
    /// Flushes the last block, writes the end mark, and hands back the sink.
    pub fn finish(self) -> io::Result<W> {
        self.encoder
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl<W: Write> Write for Lz4Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

    fn compress(data: &[u8], block_size: Lz4BlockSize) -> Vec<u8> {
        let mut writer = new_compress_writer(Vec::new(), block_size);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn output_is_deterministic() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            compress(&data, Lz4BlockSize::Max64Kb),
            compress(&data, Lz4BlockSize::Max64Kb)
        );
    }

    #[test]
    fn frame_header_carries_block_size() {
        let cases = vec![
            (Lz4BlockSize::Max64Kb, 0x40u8),
            (Lz4BlockSize::Max256Kb, 0x50u8),
            (Lz4BlockSize::Max1Mb, 0x60u8),
            (Lz4BlockSize::Max4Mb, 0x70u8),
        ];
        for (block_size, bd_byte) in cases {
            let frame = compress(b"header check", block_size);
            assert_eq!(&frame[0..4], &LZ4_MAGIC);
            assert_eq!(frame[5], bd_byte, "{:?}", block_size);
        }
    }

    #[test]
    fn incompressible_input_is_stored_raw() {
        let data: Vec<u8> = (0..16u8).collect();
        let frame = compress(&data, Lz4BlockSize::Max64Kb);

        let mut expected = LZ4_MAGIC.to_vec();
        // FLG (version 01, independent blocks), BD (64 KB), header checksum.
        expected.extend_from_slice(&[0x60, 0x40, 0x82]);
        // Block size 16 with the uncompressed bit set.
        expected.extend_from_slice(&[0x10, 0x00, 0x00, 0x80]);
        expected.extend_from_slice(&data);
        // End mark.
        expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(frame, expected);
    }

    #[test]
    fn decompress_restores_input() {
        let data: Vec<u8> = b"replicated shard state ".iter().cycle().take(300_000).cloned().collect();
        let frame = compress(&data, Lz4BlockSize::Max64Kb);
        assert!(frame.len() < data.len());

        let mut restored = Vec::new();
        new_decompress_reader(&frame[..]).read_to_end(&mut restored).unwrap();
        assert_eq!(restored, data);
    }
}
