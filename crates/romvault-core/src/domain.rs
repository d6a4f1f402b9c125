use crate::hasher::{Fingerprint, HashKind};
use serde::Deserialize;
use std::fmt;

/// The three kinds of deduplicated payload a machine can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[serde(alias = "rom")]
    File,
    Disk,
    Media,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::File, ItemKind::Disk, ItemKind::Media];

    pub fn table(self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Disk => "disk",
            ItemKind::Media => "media",
        }
    }

    pub fn association_table(self) -> &'static str {
        match self {
            ItemKind::File => "file_by_machine",
            ItemKind::Disk => "disk_by_machine",
            ItemKind::Media => "media_by_machine",
        }
    }

    /// Suffix appended to the machine-local name in directory views.
    pub fn display_suffix(self) -> &'static str {
        match self {
            ItemKind::File => "",
            ItemKind::Disk => ".chd",
            ItemKind::Media => ".aif",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Up to six optional lowercase hex digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hashes {
    pub crc32: Option<String>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub sha384: Option<String>,
    pub sha512: Option<String>,
}

impl Hashes {
    pub fn get(&self, kind: HashKind) -> Option<&str> {
        match kind {
            HashKind::Crc32 => self.crc32.as_deref(),
            HashKind::Md5 => self.md5.as_deref(),
            HashKind::Sha1 => self.sha1.as_deref(),
            HashKind::Sha256 => self.sha256.as_deref(),
            HashKind::Sha384 => self.sha384.as_deref(),
            HashKind::Sha512 => self.sha512.as_deref(),
        }
    }

    fn slot(&mut self, kind: HashKind) -> &mut Option<String> {
        match kind {
            HashKind::Crc32 => &mut self.crc32,
            HashKind::Md5 => &mut self.md5,
            HashKind::Sha1 => &mut self.sha1,
            HashKind::Sha256 => &mut self.sha256,
            HashKind::Sha384 => &mut self.sha384,
            HashKind::Sha512 => &mut self.sha512,
        }
    }

    /// Store a normalized value; invalid hex is dropped.
    pub fn set(&mut self, kind: HashKind, value: &str) {
        *self.slot(kind) = kind.normalize(value);
    }

    pub fn from_fingerprint(fp: &Fingerprint) -> Self {
        let mut hashes = Hashes::default();
        for (kind, value) in fp.iter() {
            *hashes.slot(kind) = Some(value.to_string());
        }
        hashes
    }

    pub fn is_empty(&self) -> bool {
        HashKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    /// Strongest populated digest.
    pub fn strongest(&self) -> Option<(HashKind, &str)> {
        HashKind::BY_STRENGTH
            .into_iter()
            .find_map(|kind| self.get(kind).map(|v| (kind, v)))
    }

    pub fn present(&self) -> impl Iterator<Item = (HashKind, &str)> {
        HashKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|v| (kind, v)))
    }

    /// True when some algorithm is populated on both sides with different values.
    pub fn conflicts_with(&self, other: &Hashes) -> bool {
        HashKind::ALL.into_iter().any(|kind| {
            matches!((self.get(kind), other.get(kind)), (Some(a), Some(b)) if a != b)
        })
    }

    pub fn shares_any(&self, other: &Hashes) -> bool {
        HashKind::ALL.into_iter().any(|kind| {
            matches!((self.get(kind), other.get(kind)), (Some(a), Some(b)) if a == b)
        })
    }

    /// Fill every empty slot that `other` has. Populated slots never change.
    /// Returns the algorithms that were filled.
    pub fn backfill(&mut self, other: &Hashes) -> Vec<HashKind> {
        let mut filled = Vec::new();
        for kind in HashKind::ALL {
            if let (None, Some(value)) = (self.get(kind), other.get(kind)) {
                let value = value.to_string();
                *self.slot(kind) = Some(value);
                filled.push(kind);
            }
        }
        filled
    }
}

/// Split an item name that carries an archive-style path into
/// `(directory, filename)`.
pub fn split_item_name(name: &str) -> (Option<String>, String) {
    match name.rfind(|c: char| c == '/' || c == '\\') {
        Some(idx) => {
            let dir = name[..idx].replace('\\', "/");
            let file = name[idx + 1..].to_string();
            (if dir.is_empty() { None } else { Some(dir) }, file)
        }
        None => (None, name.to_string()),
    }
}
