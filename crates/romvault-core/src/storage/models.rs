use crate::domain::{Hashes, ItemKind};
use crate::store::StoreKey;
use chrono::{DateTime, Utc};

/// One unique payload (a "file", "disk" or "media" row).
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRecord {
    pub id: i64,
    pub kind: ItemKind,
    pub hashes: Hashes,
    pub size: u64,
    pub is_in_repo: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    /// Unsaved record; `id` is assigned on insert.
    pub fn new(kind: ItemKind, hashes: Hashes, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            kind,
            hashes,
            size,
            is_in_repo: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same payload: equal size, at least one shared digest, no disagreeing digest.
    pub fn is_identity_of(&self, hashes: &Hashes, size: u64) -> bool {
        self.size == size && self.hashes.shares_any(hashes) && !self.hashes.conflicts_with(hashes)
    }

    pub fn store_key(&self) -> Option<StoreKey> {
        StoreKey::for_record(self.kind, &self.hashes)
    }
}

/// One imported DAT catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RomSet {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub date: Option<String>,
    pub homepage: Option<String>,
    pub category: Option<String>,
    pub file_name: Option<String>,
    /// SHA384 of the DAT file; key of its stored copy.
    pub sha384: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub id: i64,
    pub romset_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Machine → record link (`file_by_machine` and friends).
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub id: i64,
    pub kind: ItemKind,
    pub machine_id: i64,
    pub item_id: i64,
    /// Machine-local filename.
    pub name: String,
    /// Directory part of an archive-style item name; metadata only.
    pub path: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// An association joined with the record it points to.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineItem {
    pub association: Association,
    pub record: ContentRecord,
}

impl MachineItem {
    /// Name shown in directory listings (disks and medias get a suffix).
    pub fn display_name(&self) -> String {
        format!(
            "{}{}",
            self.association.name,
            self.association.kind.display_suffix()
        )
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.association
            .last_modified
            .unwrap_or(self.record.updated_at)
    }
}

/// Materialized completeness snapshot of one RomSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomSetStat {
    pub romset_id: i64,
    pub total_machines: i64,
    pub complete_machines: i64,
    pub incomplete_machines: i64,
    pub total_items: i64,
    pub have_items: i64,
    pub miss_items: i64,
}
