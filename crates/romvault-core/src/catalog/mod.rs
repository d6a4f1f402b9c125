//! Catalog import: resolve every DAT item against the content index and
//! persist the RomSet in one transaction.

pub mod dat;
pub mod resolve;

pub use dat::{DatCatalog, DatHeader, DatItem, DatMachine};
pub use resolve::{CandidateIndex, Resolution};

use crate::domain::{split_item_name, Hashes, ItemKind};
use crate::error::Error;
use crate::hasher::{fingerprint_bytes, Fingerprint, HashKind};
use crate::progress::ProgressReporter;
use crate::storage::models::{Association, ContentRecord, RomSet, RomSetStat};
use crate::storage::{lock, Database, SharedDatabase};
use crate::store::{ContentStore, PutOutcome, StoreKey};
use chrono::Utc;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const PROGRESS_STEP: usize = 1000;

/// Where a catalog came from; lets the original be stored and recognized.
pub struct DatSource<'a> {
    pub file_name: Option<String>,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub romset_id: i64,
    /// Set when the same DAT was already imported; nothing was written.
    pub already_imported: bool,
    pub machines: usize,
    pub items: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub matched_records: usize,
    pub stat: Option<RomSetStat>,
}

/// Items of one kind with their position in the catalog.
struct KindBatch<'c> {
    kind: ItemKind,
    items: Vec<(usize, &'c DatItem, Hashes)>,
}

struct ResolvedKind {
    index: CandidateIndex,
    /// (catalog item position, slot in the index)
    placements: Vec<(usize, usize)>,
    matched: usize,
}

pub struct CatalogImporter {
    db: SharedDatabase,
    store: Arc<ContentStore>,
}

impl CatalogImporter {
    pub fn new(db: SharedDatabase, store: Arc<ContentStore>) -> Self {
        Self { db, store }
    }

    /// Parse a JSON catalog file, keep a compressed copy of it and import it.
    pub fn import_file(
        &self,
        path: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<ImportSummary, Error> {
        let bytes = fs::read(path)?;
        let catalog = DatCatalog::from_json_slice(&bytes)?;
        let source = DatSource {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            bytes: &bytes,
        };
        self.import(&catalog, Some(source), reporter)
    }

    pub fn import(
        &self,
        catalog: &DatCatalog,
        source: Option<DatSource<'_>>,
        reporter: &dyn ProgressReporter,
    ) -> Result<ImportSummary, Error> {
        let start = Instant::now();
        let name = catalog.header.name.clone();
        info!(
            "Importing catalog '{}' ({} machines, {} items)",
            name,
            catalog.machines.len(),
            catalog.items.len()
        );

        // structural errors first: nothing is written for a broken catalog
        let machine_names = validate_machines(catalog)?;

        let dat_fp: Option<Fingerprint> = source.as_ref().map(|s| {
            reporter.on_indeterminate("Hashing catalog");
            fingerprint_bytes(s.bytes)
        });
        let dat_sha384 = dat_fp.as_ref().map(|fp| fp.get(HashKind::Sha384).to_string());

        if let Some(sha384) = &dat_sha384 {
            let existing = lock(&self.db)?.find_romset_by_sha384(sha384)?;
            if let Some(romset) = existing {
                warn!(
                    "Catalog '{}' already imported as RomSet {} ('{}')",
                    name, romset.id, romset.name
                );
                reporter.on_finished(&format!("'{}' was already imported", name));
                return Ok(ImportSummary {
                    romset_id: romset.id,
                    already_imported: true,
                    machines: 0,
                    items: 0,
                    new_records: 0,
                    updated_records: 0,
                    matched_records: 0,
                    stat: lock(&self.db)?.get_romset_stat(romset.id)?,
                });
            }
        }

        if let (Some(source), Some(fp)) = (&source, &dat_fp) {
            let key = StoreKey::for_datfile(fp);
            if self.store.put(source.bytes, &key)? == PutOutcome::Stored {
                debug!("Stored catalog original as {}", key.token());
            }
        }

        // 1. bulk candidate retrieval, one query per kind and algorithm
        reporter.on_indeterminate("Looking up known content");
        let batches = partition_by_kind(catalog);
        let mut candidates: Vec<Vec<ContentRecord>> = Vec::with_capacity(batches.len());
        {
            let db = lock(&self.db)?;
            for batch in &batches {
                candidates.push(bulk_candidates(&db, batch)?);
            }
        }

        // 2-5. resolution, each kind independently
        reporter.on_bounds(0, catalog.items.len() as u64);
        let mut resolved: Vec<ResolvedKind> = batches
            .par_iter()
            .zip(candidates.into_par_iter())
            .map(|(batch, found)| resolve_batch(batch, found))
            .collect();

        let new_records: usize = resolved.iter().map(|r| r.index.new_slots().len()).sum();
        let updated_records: usize = resolved
            .iter()
            .map(|r| r.index.updated_records().count())
            .sum();
        let matched_records: usize = resolved.iter().map(|r| r.matched).sum();
        debug!(
            "Resolved {} items: {} new, {} matched, {} backfilled",
            catalog.items.len(),
            new_records,
            matched_records,
            updated_records
        );

        // 6. persistence as a unit
        reporter.on_indeterminate("Saving catalog");
        let romset_id = {
            let db = lock(&self.db)?;
            let tx = db.connection().unchecked_transaction()?;

            let romset = romset_from_header(catalog, &source, dat_sha384);
            let romset_id = db.insert_romset(&romset)?;

            let mut machine_ids: HashMap<&str, i64> = HashMap::new();
            for machine in &catalog.machines {
                if machine_ids.contains_key(machine.name.as_str()) {
                    continue;
                }
                let id = db.insert_machine(romset_id, &machine.name, machine.description.as_deref())?;
                machine_ids.insert(machine.name.as_str(), id);
            }
            debug_assert_eq!(machine_ids.len(), machine_names.len());

            let mut persisted = 0usize;
            for kind in resolved.iter_mut() {
                for slot in kind.index.new_slots() {
                    let id = db.insert_record(kind.index.record(slot))?;
                    kind.index.set_id(slot, id);
                }
                for record in kind.index.updated_records() {
                    db.update_record_hashes(record)?;
                }
                for &(position, slot) in &kind.placements {
                    let item = &catalog.items[position];
                    let machine_id = machine_ids.get(item.machine.as_str()).copied().ok_or_else(
                        || Error::UnknownMachine {
                            machine: item.machine.clone(),
                            catalog: name.clone(),
                        },
                    )?;
                    let (path, file_name) = split_item_name(&item.name);
                    db.insert_association(&Association {
                        id: 0,
                        kind: kind.index.kind(),
                        machine_id,
                        item_id: kind.index.record(slot).id,
                        name: file_name,
                        path,
                        last_modified: item.last_modified,
                    })?;
                    persisted += 1;
                    if persisted % PROGRESS_STEP == 0 {
                        reporter.on_progress(persisted as u64);
                    }
                }
            }
            tx.commit()?;
            reporter.on_progress(persisted as u64);
            romset_id
        };

        // 7. statistics
        reporter.on_indeterminate("Computing statistics");
        let stat = lock(&self.db)?.refresh_romset_stat(romset_id)?;

        info!(
            "Imported '{}' as RomSet {} in {:.2}s: {} new records, {} matched, {} backfilled",
            name,
            romset_id,
            start.elapsed().as_secs_f64(),
            new_records,
            matched_records,
            updated_records
        );
        reporter.on_finished(&format!(
            "Imported '{}': {} machines, {} items ({} new)",
            name,
            machine_names.len(),
            catalog.items.len(),
            new_records
        ));

        Ok(ImportSummary {
            romset_id,
            already_imported: false,
            machines: machine_names.len(),
            items: catalog.items.len(),
            new_records,
            updated_records,
            matched_records,
            stat: Some(stat),
        })
    }

    /// Remove a RomSet with its machines and associations. Content records
    /// and stored payloads stay; the stored DAT copy goes when no other
    /// RomSet refers to it.
    pub fn remove_romset(&self, romset_id: i64) -> Result<bool, Error> {
        let db = lock(&self.db)?;
        let Some(romset) = db.get_romset(romset_id)? else {
            return Ok(false);
        };
        db.delete_romset(romset_id)?;
        if let Some(sha384) = &romset.sha384 {
            let still_used = db.find_romset_by_sha384(sha384)?.is_some();
            if !still_used {
                if let Some(key) = StoreKey::for_datfile_digest(sha384) {
                    self.store.remove(&key)?;
                }
            }
        }
        info!("Removed RomSet {} ('{}')", romset_id, romset.name);
        Ok(true)
    }
}

/// Distinct machine names; fails on the first item naming an unknown one.
fn validate_machines(catalog: &DatCatalog) -> Result<HashSet<&str>, Error> {
    let names: HashSet<&str> = catalog.machines.iter().map(|m| m.name.as_str()).collect();
    if let Some(item) = catalog
        .items
        .iter()
        .find(|item| !names.contains(item.machine.as_str()))
    {
        return Err(Error::UnknownMachine {
            machine: item.machine.clone(),
            catalog: catalog.header.name.clone(),
        });
    }
    Ok(names)
}

fn partition_by_kind(catalog: &DatCatalog) -> Vec<KindBatch<'_>> {
    let mut batches: Vec<KindBatch<'_>> = ItemKind::ALL
        .into_iter()
        .map(|kind| KindBatch {
            kind,
            items: Vec::new(),
        })
        .collect();
    for (position, item) in catalog.items.iter().enumerate() {
        if let Some(batch) = batches.iter_mut().find(|b| b.kind == item.kind) {
            batch.items.push((position, item, item.hashes()));
        }
    }
    batches.retain(|b| !b.items.is_empty());
    batches
}

fn bulk_candidates(db: &Database, batch: &KindBatch<'_>) -> Result<Vec<ContentRecord>, Error> {
    let mut found = Vec::new();
    for algo in HashKind::BY_STRENGTH {
        let pairs: BTreeSet<(String, u64)> = batch
            .items
            .iter()
            .filter_map(|(_, item, hashes)| hashes.get(algo).map(|v| (v.to_string(), item.size)))
            .collect();
        if pairs.is_empty() {
            continue;
        }
        let pairs: Vec<(String, u64)> = pairs.into_iter().collect();
        found.extend(db.bulk_existence_query(batch.kind, algo, &pairs)?);
    }
    Ok(found)
}

/// Items are resolved richest first (most digests, then catalog position)
/// so weakly described items land on the record of a fuller description.
fn resolve_batch(batch: &KindBatch<'_>, candidates: Vec<ContentRecord>) -> ResolvedKind {
    let mut index = CandidateIndex::from_candidates(batch.kind, candidates);
    let mut order: Vec<&(usize, &DatItem, Hashes)> = batch.items.iter().collect();
    order.sort_by_key(|(position, _, hashes)| (Reverse(hashes.present().count()), *position));

    let mut placements = Vec::with_capacity(batch.items.len());
    let mut matched = 0;
    for (position, item, hashes) in order {
        let resolution = index.resolve(hashes, item.size);
        if !resolution.created {
            matched += 1;
        }
        placements.push((*position, resolution.slot));
    }
    for placement in placements.iter_mut() {
        placement.1 = index.canonical(placement.1);
    }
    placements.sort_unstable_by_key(|&(position, _)| position);
    ResolvedKind {
        index,
        placements,
        matched,
    }
}

fn romset_from_header(
    catalog: &DatCatalog,
    source: &Option<DatSource<'_>>,
    sha384: Option<String>,
) -> RomSet {
    let header = &catalog.header;
    let now = Utc::now();
    RomSet {
        id: 0,
        name: header.name.clone(),
        description: header.description.clone(),
        version: header.version.clone(),
        author: header.author.clone(),
        date: header.date.clone(),
        homepage: header.homepage.clone(),
        category: header.category.clone(),
        file_name: source.as_ref().and_then(|s| s.file_name.clone()),
        sha384,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(items: Vec<DatItem>) -> DatCatalog {
        DatCatalog {
            header: DatHeader {
                name: "A".to_string(),
                ..Default::default()
            },
            machines: vec![DatMachine {
                name: "M1".to_string(),
                description: None,
            }],
            items,
        }
    }

    #[test]
    fn test_validate_rejects_unknown_machine() {
        let c = catalog(vec![DatItem::new("M2", ItemKind::File, "x.bin", 1)]);
        match validate_machines(&c) {
            Err(Error::UnknownMachine { machine, catalog }) => {
                assert_eq!(machine, "M2");
                assert_eq!(catalog, "A");
            }
            other => panic!("unexpected: {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_partition_keeps_catalog_positions() {
        let c = catalog(vec![
            DatItem::new("M1", ItemKind::Disk, "d", 1),
            DatItem::new("M1", ItemKind::File, "f", 1),
            DatItem::new("M1", ItemKind::Disk, "e", 1),
        ]);
        let batches = partition_by_kind(&c);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].kind, ItemKind::File);
        let disk_positions: Vec<usize> = batches[1].items.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(disk_positions, vec![0, 2]);
    }

    #[test]
    fn test_resolve_batch_prefers_richest_item() {
        let sha1 = "e".repeat(40);
        let mut crc_only = DatItem::new("M1", ItemKind::File, "crc", 8);
        crc_only.crc32 = Some("deadbeef".to_string());
        let mut sha_only = DatItem::new("M1", ItemKind::File, "sha", 8);
        sha_only.sha1 = Some(sha1.clone());
        let mut both = DatItem::new("M1", ItemKind::File, "both", 8);
        both.crc32 = Some("deadbeef".to_string());
        both.sha1 = Some(sha1);

        let c = catalog(vec![crc_only, sha_only, both]);
        let batches = partition_by_kind(&c);
        let resolved = resolve_batch(&batches[0], Vec::new());

        assert_eq!(resolved.index.new_slots().len(), 1);
        assert_eq!(resolved.matched, 2);
        let positions: Vec<usize> = resolved.placements.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(resolved
            .placements
            .iter()
            .all(|&(_, slot)| slot == resolved.placements[0].1));
    }
}
