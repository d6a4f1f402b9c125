use super::HashKind;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Bytes fed to the digests per update.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// All six digests of one payload plus its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    size: u64,
    crc32: String,
    md5: String,
    sha1: String,
    sha256: String,
    sha384: String,
    sha512: String,
}

impl Fingerprint {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Lowercase hex digest for `kind`.
    pub fn get(&self, kind: HashKind) -> &str {
        match kind {
            HashKind::Crc32 => &self.crc32,
            HashKind::Md5 => &self.md5,
            HashKind::Sha1 => &self.sha1,
            HashKind::Sha256 => &self.sha256,
            HashKind::Sha384 => &self.sha384,
            HashKind::Sha512 => &self.sha512,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (HashKind, &str)> {
        HashKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

/// Runs the six digests side by side.
pub struct MultiHasher {
    crc32: crc32fast::Hasher,
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha384: Sha384,
    sha512: Sha512,
    size: u64,
}

impl Default for MultiHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiHasher {
    pub fn new() -> Self {
        Self {
            crc32: crc32fast::Hasher::new(),
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha384: Sha384::new(),
            sha512: Sha512::new(),
            size: 0,
        }
    }

    /// Feed one chunk to every digest. The six updates run concurrently, so a
    /// call costs roughly as much as the slowest algorithm.
    pub fn update(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len() as u64;

        let MultiHasher {
            crc32,
            md5,
            sha1,
            sha256,
            sha384,
            sha512,
            ..
        } = self;

        rayon::scope(|s| {
            s.spawn(move |_| crc32.update(chunk));
            s.spawn(move |_| Digest::update(md5, chunk));
            s.spawn(move |_| Digest::update(sha1, chunk));
            s.spawn(move |_| Digest::update(sha256, chunk));
            s.spawn(move |_| Digest::update(sha384, chunk));
            s.spawn(move |_| Digest::update(sha512, chunk));
        });
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint {
            size: self.size,
            crc32: format!("{:08x}", self.crc32.finalize()),
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
            sha384: hex::encode(self.sha384.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
        }
    }
}

pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = MultiHasher::new();
    for chunk in data.chunks(CHUNK_SIZE) {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Fingerprint a stream in [`CHUNK_SIZE`] pieces.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<Fingerprint> {
    let mut hasher = MultiHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let filled = fill_chunk(&mut reader, &mut buffer)?;
        if filled == 0 {
            break;
        }
        hasher.update(&buffer[..filled]);
    }
    Ok(hasher.finalize())
}

pub fn fingerprint_path(path: &Path) -> io::Result<Fingerprint> {
    let file = File::open(path)?;
    fingerprint_reader(BufReader::with_capacity(CHUNK_SIZE, file))
}

/// Read until `buffer` is full or the stream ends.
fn fill_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Pass-through reader that fingerprints everything read through it.
///
/// Lets a consumer (the compressor) drain a stream while the digests are
/// computed in the same pass.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: MultiHasher,
    pending: Vec<u8>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: MultiHasher::new(),
            pending: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    pub fn finish(mut self) -> Fingerprint {
        if !self.pending.is_empty() {
            self.hasher.update(&self.pending);
        }
        self.hasher.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() >= CHUNK_SIZE {
            self.hasher.update(&self.pending);
            self.pending.clear();
        }
        Ok(n)
    }
}
