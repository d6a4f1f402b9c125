//! Structured catalog records as produced by an external DAT parser.
//!
//! The CLI reads them as JSON:
//!
//! ```json
//! {
//!   "header": { "name": "A", "version": "1.0" },
//!   "machines": [ { "name": "M1" } ],
//!   "items": [ { "machine": "M1", "kind": "rom", "name": "m1.bin",
//!                "size": 1024, "crc": "DEADBEEF" } ]
//! }
//! ```

use crate::domain::{Hashes, ItemKind};
use crate::error::Error;
use crate::hasher::HashKind;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatHeader {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatMachine {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatItem {
    pub machine: String,
    #[serde(default = "default_kind")]
    pub kind: ItemKind,
    pub name: String,
    pub size: u64,
    #[serde(default, alias = "crc")]
    pub crc32: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub sha384: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

fn default_kind() -> ItemKind {
    ItemKind::File
}

impl DatItem {
    pub fn new(machine: &str, kind: ItemKind, name: &str, size: u64) -> Self {
        Self {
            machine: machine.to_string(),
            kind,
            name: name.to_string(),
            size,
            crc32: None,
            md5: None,
            sha1: None,
            sha256: None,
            sha384: None,
            sha512: None,
            last_modified: None,
        }
    }

    pub fn with_hash(mut self, kind: HashKind, value: &str) -> Self {
        let slot = match kind {
            HashKind::Crc32 => &mut self.crc32,
            HashKind::Md5 => &mut self.md5,
            HashKind::Sha1 => &mut self.sha1,
            HashKind::Sha256 => &mut self.sha256,
            HashKind::Sha384 => &mut self.sha384,
            HashKind::Sha512 => &mut self.sha512,
        };
        *slot = Some(value.to_string());
        self
    }

    /// Normalized digests; malformed values are dropped.
    pub fn hashes(&self) -> Hashes {
        let mut hashes = Hashes::default();
        let raw = [
            (HashKind::Crc32, &self.crc32),
            (HashKind::Md5, &self.md5),
            (HashKind::Sha1, &self.sha1),
            (HashKind::Sha256, &self.sha256),
            (HashKind::Sha384, &self.sha384),
            (HashKind::Sha512, &self.sha512),
        ];
        for (kind, value) in raw {
            if let Some(value) = value {
                hashes.set(kind, value);
            }
        }
        hashes
    }
}

/// One parsed DAT: header, machine list, items in catalog order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatCatalog {
    pub header: DatHeader,
    #[serde(default)]
    pub machines: Vec<DatMachine>,
    #[serde(default)]
    pub items: Vec<DatItem>,
}

impl DatCatalog {
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, Error> {
        serde_json::from_reader(reader)
            .map_err(|e| Error::Other(format!("Invalid catalog JSON: {}", e)))
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Other(format!("Invalid catalog JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_catalog() {
        let json = br#"{
            "header": { "name": "A", "version": "1.0" },
            "machines": [ { "name": "M1", "description": "Machine one" } ],
            "items": [
                { "machine": "M1", "kind": "rom", "name": "m1.bin", "size": 1024, "crc": "DEADBEEF" },
                { "machine": "M1", "kind": "disk", "name": "m1", "size": 9, "sha1": "bad" }
            ]
        }"#;
        let catalog = DatCatalog::from_json_slice(json).unwrap();
        assert_eq!(catalog.header.name, "A");
        assert_eq!(catalog.machines.len(), 1);
        assert_eq!(catalog.items[0].kind, ItemKind::File);
        assert_eq!(catalog.items[1].kind, ItemKind::Disk);

        let hashes = catalog.items[0].hashes();
        assert_eq!(hashes.crc32.as_deref(), Some("deadbeef"));
        assert!(catalog.items[1].hashes().is_empty());
    }

    #[test]
    fn test_missing_header_name_is_rejected() {
        assert!(DatCatalog::from_json_slice(br#"{"header": {}}"#).is_err());
    }
}
