pub mod fingerprint;

pub use fingerprint::{
    fingerprint_bytes, fingerprint_path, fingerprint_reader, Fingerprint, HashingReader,
    MultiHasher, CHUNK_SIZE,
};

use std::fmt;
use std::str::FromStr;

/// The six checksum algorithms tracked for every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashKind {
    Crc32,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    pub const ALL: [HashKind; 6] = [
        HashKind::Crc32,
        HashKind::Md5,
        HashKind::Sha1,
        HashKind::Sha256,
        HashKind::Sha384,
        HashKind::Sha512,
    ];

    /// Probe order for identity resolution, strongest first.
    pub const BY_STRENGTH: [HashKind; 6] = [
        HashKind::Sha512,
        HashKind::Sha384,
        HashKind::Sha256,
        HashKind::Sha1,
        HashKind::Md5,
        HashKind::Crc32,
    ];

    /// Lowercase name, also used as the index column name.
    pub fn as_str(self) -> &'static str {
        match self {
            HashKind::Crc32 => "crc32",
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
            HashKind::Sha384 => "sha384",
            HashKind::Sha512 => "sha512",
        }
    }

    /// Length of the hex representation.
    pub fn hex_len(self) -> usize {
        match self {
            HashKind::Crc32 => 8,
            HashKind::Md5 => 32,
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
            HashKind::Sha384 => 96,
            HashKind::Sha512 => 128,
        }
    }

    /// Trim and lowercase `value`, rejecting anything that is not a hex string
    /// of the right length for this algorithm.
    pub fn normalize(self, value: &str) -> Option<String> {
        let value = value.trim();
        if value.len() != self.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(value.to_ascii_lowercase())
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown hash kind '{}'", s))
    }
}
