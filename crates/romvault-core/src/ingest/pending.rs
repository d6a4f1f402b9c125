use crate::domain::{Hashes, ItemKind};
use crate::error::Error;
use crate::hasher::HashKind;
use crate::storage::models::ContentRecord;
use crate::storage::Database;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

/// What a worker already decided about a payload (keyed by SHA384).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeenPayload {
    Stored,
    Unknown,
}

/// Counters of one worker; summed into the ingest summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestTally {
    pub files: u64,
    pub archives: u64,
    pub members: u64,
    /// Payloads written to the store.
    pub stored: u64,
    /// Payloads whose store file already existed.
    pub already_present: u64,
    /// Payloads resolved to at least one existing record.
    pub matched: u64,
    /// Payloads that got a new record.
    pub created: u64,
    pub skipped_unknown: u64,
    pub failed: u64,
    pub deleted: u64,
    pub aborted_items: u64,
}

impl IngestTally {
    pub fn add(&mut self, other: &IngestTally) {
        self.files += other.files;
        self.archives += other.archives;
        self.members += other.members;
        self.stored += other.stored;
        self.already_present += other.already_present;
        self.matched += other.matched;
        self.created += other.created;
        self.skipped_unknown += other.skipped_unknown;
        self.failed += other.failed;
        self.deleted += other.deleted;
        self.aborted_items += other.aborted_items;
    }
}

/// Worker-local state of one phase. Nothing here touches the index until
/// [`merge_pending`] runs at the phase boundary.
#[derive(Debug, Default)]
pub(crate) struct PendingCache {
    pub seen: HashMap<String, SeenPayload>,
    /// Existing records now present in the store, with backfilled digests.
    pub in_repo: HashMap<(ItemKind, i64), ContentRecord>,
    /// Records for payloads the index did not describe.
    pub created: Vec<ContentRecord>,
    /// Sources to delete once the phase is committed.
    pub deletions: Vec<PathBuf>,
    pub tally: IngestTally,
}

impl PendingCache {
    pub fn mark_in_repo(&mut self, record: ContentRecord) {
        let key = (record.kind, record.id);
        match self.in_repo.get_mut(&key) {
            Some(existing) => {
                existing.hashes.backfill(&record.hashes);
            }
            None => {
                self.in_repo.insert(key, record);
            }
        }
    }
}

/// Outcome of writing the caches of one phase.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MergeStats {
    pub marked: usize,
    pub inserted: usize,
    /// New records another worker (or an earlier run) already inserted.
    pub deduplicated: usize,
}

/// Write every worker's cache in one transaction. Records created by
/// several workers for the same payload collapse on SHA512 + size.
pub(crate) fn merge_pending(db: &Database, caches: &[PendingCache]) -> Result<MergeStats, Error> {
    let mut stats = MergeStats::default();
    let tx = db.connection().unchecked_transaction()?;

    let mut marked: HashSet<(ItemKind, i64)> = HashSet::new();
    for cache in caches {
        for record in cache.in_repo.values() {
            db.update_record_hashes(record)?;
            if marked.insert((record.kind, record.id)) {
                db.set_in_repo(record.kind, record.id, true)?;
                stats.marked += 1;
            }
        }
    }

    let mut inserted: HashSet<(String, u64)> = HashSet::new();
    for cache in caches {
        for record in &cache.created {
            let Some(sha512) = record.hashes.get(HashKind::Sha512) else {
                continue;
            };
            if !inserted.insert((sha512.to_string(), record.size)) {
                stats.deduplicated += 1;
                continue;
            }
            let existing = db
                .find_records(record.kind, HashKind::Sha512, sha512, record.size)?
                .into_iter()
                .find(|r| r.is_identity_of(&record.hashes, record.size));
            match existing {
                Some(mut found) => {
                    found.hashes.backfill(&record.hashes);
                    db.update_record_hashes(&found)?;
                    db.set_in_repo(found.kind, found.id, true)?;
                    stats.deduplicated += 1;
                }
                None => {
                    let mut fresh = record.clone();
                    fresh.is_in_repo = true;
                    db.insert_record(&fresh)?;
                    stats.inserted += 1;
                }
            }
        }
    }

    tx.commit()?;
    debug!(
        "Merged pending caches: {} marked, {} inserted, {} deduplicated",
        stats.marked, stats.inserted, stats.deduplicated
    );
    Ok(stats)
}

/// Cascading probe against the live index, strongest digest first. Every
/// record of every kind that is the same payload is returned once.
pub(crate) fn lookup_payload(
    db: &Database,
    hashes: &Hashes,
    size: u64,
) -> Result<Vec<ContentRecord>, Error> {
    let mut found = Vec::new();
    let mut ids: HashSet<(ItemKind, i64)> = HashSet::new();
    for kind in ItemKind::ALL {
        for algo in HashKind::BY_STRENGTH {
            let Some(value) = hashes.get(algo) else {
                continue;
            };
            for record in db.find_records(kind, algo, value, size)? {
                if record.is_identity_of(hashes, size) && ids.insert((kind, record.id)) {
                    found.push(record);
                }
            }
        }
    }
    Ok(found)
}

/// Cheap known-only pre-check on a CRC32 from an archive directory.
pub(crate) fn crc_is_known(db: &Database, crc32: &str, size: u64) -> Result<bool, Error> {
    for kind in ItemKind::ALL {
        if !db.find_records(kind, HashKind::Crc32, crc32, size)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint_bytes;

    #[test]
    fn test_merge_collapses_duplicate_creations() {
        let db = Database::open_in_memory().unwrap();
        let hashes = Hashes::from_fingerprint(&fingerprint_bytes(b"same payload"));
        let record = ContentRecord::new(ItemKind::File, hashes, 12);

        let mut a = PendingCache::default();
        a.created.push(record.clone());
        let mut b = PendingCache::default();
        b.created.push(record);

        let stats = merge_pending(&db, &[a, b]).unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(db.count_records(ItemKind::File).unwrap(), 1);
    }

    #[test]
    fn test_lookup_skips_collisions() {
        let db = Database::open_in_memory().unwrap();
        let mut crc_only = Hashes::default();
        crc_only.set(HashKind::Crc32, "deadbeef");
        let mut other_sha = crc_only.clone();
        other_sha.set(HashKind::Sha1, &"a".repeat(40));

        db.insert_record(&ContentRecord::new(ItemKind::File, other_sha, 4))
            .unwrap();
        let id = db
            .insert_record(&ContentRecord::new(ItemKind::File, crc_only.clone(), 8))
            .unwrap();

        let mut incoming = crc_only.clone();
        incoming.set(HashKind::Sha1, &"b".repeat(40));
        let found = lookup_payload(&db, &incoming, 8).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);

        assert!(lookup_payload(&db, &incoming, 4).unwrap().is_empty());
        assert!(crc_is_known(&db, "deadbeef", 4).unwrap());
        assert!(!crc_is_known(&db, "deadbeef", 5).unwrap());
    }

    #[test]
    fn test_lookup_returns_every_matching_record() {
        let db = Database::open_in_memory().unwrap();
        let full = Hashes::from_fingerprint(&fingerprint_bytes(b"split payload"));
        let mut crc_only = Hashes::default();
        crc_only.set(HashKind::Crc32, full.crc32.as_deref().unwrap());
        let mut sha_only = Hashes::default();
        sha_only.set(HashKind::Sha1, full.sha1.as_deref().unwrap());

        let a = db
            .insert_record(&ContentRecord::new(ItemKind::File, crc_only, 13))
            .unwrap();
        let b = db
            .insert_record(&ContentRecord::new(ItemKind::File, sha_only, 13))
            .unwrap();

        let mut ids: Vec<i64> = lookup_payload(&db, &full, 13)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![a, b]);
    }
}
