//! Content-addressed payload store.
//!
//! Every payload is compressed once and written under a path derived from
//! one of its digests:
//!
//! ```text
//! <repo>/files/<c0>/<c1>/<c2>/<c3>/<c4>/<Base32(SHA384)>.lz
//! <repo>/disks/<c0>/<c1>/<Base32(SHA1 | MD5)>.lz
//! <repo>/medias/<c0>/<c1>/<Base32(SHA256 | SHA1 | MD5)>.lz
//! <repo>/datfiles/<Base32(SHA384 of the DAT)>.lz
//! ```
//!
//! Writes go to a temp file under the staging directory and are published
//! with no-clobber semantics, so a concurrent duplicate put is harmless.

pub mod base32;
pub mod codec;
pub mod seek;

pub use codec::{Compressor, ZstdCompressor};
pub use seek::ForwardSeekReader;

use crate::config::RepoConfig;
use crate::domain::{Hashes, ItemKind};
use crate::error::Error;
use crate::hasher::{Fingerprint, HashKind, HashingReader};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

const FILE_SHARD_DEPTH: usize = 5;
const WEAK_SHARD_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    Files,
    Disks,
    Medias,
    DatFiles,
}

impl KeySpace {
    fn directory(self) -> &'static str {
        match self {
            KeySpace::Files => "files",
            KeySpace::Disks => "disks",
            KeySpace::Medias => "medias",
            KeySpace::DatFiles => "datfiles",
        }
    }

    fn shard_depth(self) -> usize {
        match self {
            KeySpace::Files => FILE_SHARD_DEPTH,
            KeySpace::Disks | KeySpace::Medias => WEAK_SHARD_DEPTH,
            KeySpace::DatFiles => 0,
        }
    }

    /// Digests usable as identity in this key space, in preference order.
    fn identity_hashes(self) -> &'static [HashKind] {
        match self {
            KeySpace::Files | KeySpace::DatFiles => &[HashKind::Sha384],
            KeySpace::Disks => &[HashKind::Sha1, HashKind::Md5],
            KeySpace::Medias => &[HashKind::Sha256, HashKind::Sha1, HashKind::Md5],
        }
    }
}

impl From<ItemKind> for KeySpace {
    fn from(kind: ItemKind) -> Self {
        match kind {
            ItemKind::File => KeySpace::Files,
            ItemKind::Disk => KeySpace::Disks,
            ItemKind::Media => KeySpace::Medias,
        }
    }
}

/// Location of one payload: key space plus Base32 token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    space: KeySpace,
    token: String,
}

impl StoreKey {
    fn from_hex(space: KeySpace, hex_digest: &str) -> Option<Self> {
        let raw = hex::decode(hex_digest).ok()?;
        Some(Self {
            space,
            token: base32::encode(&raw),
        })
    }

    /// Key for a record of `kind`, or `None` when it lacks every identity
    /// digest its key space accepts.
    pub fn for_record(kind: ItemKind, hashes: &Hashes) -> Option<Self> {
        let space = KeySpace::from(kind);
        space
            .identity_hashes()
            .iter()
            .find_map(|algo| hashes.get(*algo))
            .and_then(|digest| Self::from_hex(space, digest))
    }

    /// A full fingerprint always yields a key.
    pub fn for_fingerprint(kind: ItemKind, fp: &Fingerprint) -> Self {
        let space = KeySpace::from(kind);
        let algo = space.identity_hashes()[0];
        Self {
            space,
            token: base32::encode(&hex::decode(fp.get(algo)).unwrap_or_default()),
        }
    }

    pub fn for_datfile(fp: &Fingerprint) -> Self {
        Self {
            space: KeySpace::DatFiles,
            token: base32::encode(&hex::decode(fp.get(HashKind::Sha384)).unwrap_or_default()),
        }
    }

    /// Key of a stored DAT from its recorded SHA384 hex digest.
    pub fn for_datfile_digest(sha384: &str) -> Option<Self> {
        Self::from_hex(KeySpace::DatFiles, sha384)
    }

    pub fn space(&self) -> KeySpace {
        self.space
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Path relative to the repository root. Pure function of the token.
    pub fn relative_path(&self, extension: &str) -> PathBuf {
        let mut path = PathBuf::from(self.space.directory());
        for c in self.token.chars().take(self.space.shard_depth()) {
            path.push(c.to_string());
        }
        path.push(format!("{}.{}", self.token, extension));
        path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyPresent,
}

/// A payload compressed into the staging area whose key was not known
/// before the pass. Dropping it discards the temp file.
pub struct StagedPayload {
    file: NamedTempFile,
    fingerprint: Fingerprint,
}

impl StagedPayload {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// Decompressing stream over a stored payload.
pub struct StoredReader {
    inner: Box<dyn Read + Send>,
    len: u64,
}

impl StoredReader {
    /// Uncompressed size.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for StoredReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

pub struct ContentStore {
    root: PathBuf,
    temp_dir: PathBuf,
    codec: Arc<dyn Compressor>,
    level: i32,
}

impl ContentStore {
    pub fn open(config: &RepoConfig) -> Result<Self, Error> {
        Self::new(
            config.repository_path.clone(),
            config.temp_dir(),
            config.compression_level,
        )
    }

    pub fn new(root: PathBuf, temp_dir: PathBuf, level: i32) -> Result<Self, Error> {
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&temp_dir)?;
        debug!("Content store at {}", root.display());
        Ok(Self {
            root,
            temp_dir,
            codec: Arc::new(ZstdCompressor),
            level,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.root.join(key.relative_path(self.codec.extension()))
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Compress `reader` under `key`. Existing payloads are left untouched.
    pub fn put<R: Read>(&self, mut reader: R, key: &StoreKey) -> Result<PutOutcome, Error> {
        if self.contains(key) {
            trace!("{} already in store", key.token());
            return Ok(PutOutcome::AlreadyPresent);
        }
        let mut temp = NamedTempFile::new_in(&self.temp_dir)?;
        self.compress_into(&mut reader, temp.as_file_mut())?;
        self.publish(temp, key)
    }

    pub fn put_path(&self, source: &Path, key: &StoreKey) -> Result<PutOutcome, Error> {
        if self.contains(key) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        let file = File::open(source)?;
        self.put(BufReader::new(file), key)
    }

    /// Compress `reader` into the staging area while fingerprinting it.
    pub fn stage<R: Read>(&self, reader: R) -> Result<StagedPayload, Error> {
        let mut temp = NamedTempFile::new_in(&self.temp_dir)?;
        let mut hashing = HashingReader::new(reader);
        self.compress_into(&mut hashing, temp.as_file_mut())?;
        Ok(StagedPayload {
            file: temp,
            fingerprint: hashing.finish(),
        })
    }

    /// Publish a staged payload under every key in `keys`.
    pub fn commit(
        &self,
        staged: StagedPayload,
        keys: &[StoreKey],
    ) -> Result<Vec<PutOutcome>, Error> {
        let mut outcomes = Vec::with_capacity(keys.len());
        let mut remaining = Some(staged.file);
        let mut published: Option<PathBuf> = None;

        for key in keys {
            if self.contains(key) {
                published.get_or_insert_with(|| self.path_for(key));
                outcomes.push(PutOutcome::AlreadyPresent);
                continue;
            }
            let outcome = match (remaining.take(), &published) {
                (Some(temp), _) => self.publish(temp, key)?,
                (None, Some(source)) => self.copy_compressed(source, key)?,
                (None, None) => {
                    return Err(Error::Other("staged payload already consumed".to_string()))
                }
            };
            published = Some(self.path_for(key));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Open a decompressing stream for `key`; `size` is the uncompressed length.
    pub fn get(&self, key: &StoreKey, size: u64) -> Result<StoredReader, Error> {
        let path = self.path_for(key);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let inner = self.codec.decoder(Box::new(BufReader::new(file)))?;
        Ok(StoredReader { inner, len: size })
    }

    pub fn get_seekable(
        &self,
        key: &StoreKey,
        size: u64,
    ) -> Result<ForwardSeekReader<StoredReader>, Error> {
        let reader = self.get(key, size)?;
        Ok(ForwardSeekReader::new_in(reader, size, &self.temp_dir)?)
    }

    /// Delete a stored payload. Returns false when it was not present.
    pub fn remove(&self, key: &StoreKey) -> Result<bool, Error> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn compress_into(&self, reader: &mut dyn Read, file: &mut File) -> Result<u64, Error> {
        let mut writer = BufWriter::new(file);
        let n = self.codec.compress(reader, &mut writer, self.level)?;
        writer.flush()?;
        drop(writer);
        Ok(n)
    }

    fn publish(&self, temp: NamedTempFile, key: &StoreKey) -> Result<PutOutcome, Error> {
        let target = self.path_for(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.as_file().sync_all()?;
        match temp.persist_noclobber(&target) {
            Ok(_) => {
                trace!("Stored {}", target.display());
                Ok(PutOutcome::Stored)
            }
            // lost a race against an identical put
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn copy_compressed(&self, source: &Path, key: &StoreKey) -> Result<PutOutcome, Error> {
        let mut temp = NamedTempFile::new_in(&self.temp_dir)?;
        io::copy(&mut File::open(source)?, temp.as_file_mut())?;
        self.publish(temp, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint_bytes;

    #[test]
    fn test_file_key_path_layout() {
        let fp = fingerprint_bytes(b"abc");
        let key = StoreKey::for_fingerprint(ItemKind::File, &fp);
        let rel = key.relative_path("lz");
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0], "files");
        let token = key.token();
        assert_eq!(token.len(), 77);
        for (i, c) in token.chars().take(5).enumerate() {
            assert_eq!(parts[i + 1], c.to_string());
        }
        assert_eq!(parts[6], format!("{}.lz", token));
    }

    #[test]
    fn test_weak_keys_fall_back() {
        let mut hashes = Hashes::default();
        assert!(StoreKey::for_record(ItemKind::Disk, &hashes).is_none());

        hashes.set(HashKind::Md5, "900150983cd24fb0d6963f7d28e17f72");
        let md5_key = StoreKey::for_record(ItemKind::Disk, &hashes).unwrap();
        assert_eq!(md5_key.space(), KeySpace::Disks);
        assert_eq!(md5_key.token().len(), 26);

        hashes.set(HashKind::Sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        let sha1_key = StoreKey::for_record(ItemKind::Disk, &hashes).unwrap();
        assert_eq!(sha1_key.token().len(), 32);

        // files only key on SHA384
        assert!(StoreKey::for_record(ItemKind::File, &hashes).is_none());

        let rel = sha1_key.relative_path("lz");
        assert_eq!(rel.components().count(), 4);
    }

    #[test]
    fn test_record_key_matches_fingerprint_key() {
        let fp = fingerprint_bytes(b"payload");
        let hashes = Hashes::from_fingerprint(&fp);
        for kind in ItemKind::ALL {
            assert_eq!(
                StoreKey::for_record(kind, &hashes),
                Some(StoreKey::for_fingerprint(kind, &fp))
            );
        }
    }
}
