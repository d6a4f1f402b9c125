#![allow(dead_code)]

use romvault_core::catalog::{DatCatalog, DatHeader, DatItem, DatMachine};
use romvault_core::hasher::{fingerprint_bytes, HashKind};
use romvault_core::{ContentStore, Database, ItemKind, RepoConfig, SharedDatabase};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// A repository in a temp directory with an in-memory index.
pub struct TestRepo {
    pub dir: TempDir,
    pub config: RepoConfig,
    pub db: SharedDatabase,
    pub store: Arc<ContentStore>,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = RepoConfig::new(dir.path().join("repo"));
        config.workers = Some(2);
        let store = Arc::new(ContentStore::open(&config).unwrap());
        let db = Database::open_in_memory().unwrap().into_shared();
        Self {
            dir,
            config,
            db,
            store,
        }
    }

    /// Empty folder for ingest sources, outside the repository.
    pub fn source_dir(&self) -> PathBuf {
        let path = self.dir.path().join("incoming");
        fs::create_dir_all(&path).unwrap();
        path
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn catalog(name: &str, machines: &[&str], items: Vec<DatItem>) -> DatCatalog {
    DatCatalog {
        header: DatHeader {
            name: name.to_string(),
            version: Some("1.0".to_string()),
            ..DatHeader::default()
        },
        machines: machines
            .iter()
            .map(|m| DatMachine {
                name: m.to_string(),
                description: None,
            })
            .collect(),
        items,
    }
}

/// Catalog item describing `data` by its CRC32 only.
pub fn crc_item(machine: &str, name: &str, data: &[u8]) -> DatItem {
    let fp = fingerprint_bytes(data);
    DatItem::new(machine, ItemKind::File, name, data.len() as u64)
        .with_hash(HashKind::Crc32, fp.get(HashKind::Crc32))
}
