use std::io::{self, Read, Write};

/// Single-stream codec the store orchestrates. Payloads are compressed
/// whole; there is no framing of our own.
pub trait Compressor: Send + Sync {
    /// File extension of stored payloads, without the dot.
    fn extension(&self) -> &'static str;
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> io::Result<u64>;
    fn decoder(&self, src: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;
}

pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn extension(&self) -> &'static str {
        "lz"
    }

    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> io::Result<u64> {
        let mut enc = zstd::stream::Encoder::new(dst, level.max(1))?;
        let written_uncompressed = io::copy(src, &mut enc)?;
        enc.finish()?;
        Ok(written_uncompressed)
    }

    fn decoder(&self, src: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        let dec = zstd::stream::read::Decoder::new(src)?;
        Ok(Box::new(dec))
    }
}
