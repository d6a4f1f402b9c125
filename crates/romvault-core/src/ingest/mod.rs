//! Folder ingestion: scan, separate archives, store every payload once.
//!
//! Workers never write the index directly. Each one fills a local
//! [`pending::PendingCache`] that is merged in a single transaction when
//! the phase ends; store files are published as soon as they are written.

mod archive;
mod pending;

pub use pending::IngestTally;

use crate::config::RepoConfig;
use crate::domain::{Hashes, ItemKind};
use crate::error::Error;
use crate::hasher::{fingerprint_path, Fingerprint, HashKind};
use crate::progress::ProgressReporter;
use crate::scanner::{self, Candidate, EntryClass};
use crate::storage::models::ContentRecord;
use crate::storage::{lock, SharedDatabase};
use crate::store::{ContentStore, PutOutcome, StoreKey};
use pending::{lookup_payload, merge_pending, PendingCache, SeenPayload};
use rayon::prelude::*;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    Idle,
    Scanning,
    SeparatingArchives,
    ImportingPlainFiles,
    ImportingArchiveMembers,
    Done,
}

impl fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IngestPhase::Idle => "Idle",
            IngestPhase::Scanning => "Scanning",
            IngestPhase::SeparatingArchives => "Separating archives",
            IngestPhase::ImportingPlainFiles => "Importing files",
            IngestPhase::ImportingArchiveMembers => "Importing archive members",
            IngestPhase::Done => "Done",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub tally: IngestTally,
    pub aborted: bool,
    pub duration: Duration,
}

/// What happened to one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadOutcome {
    Stored,
    AlreadyPresent,
    SkippedUnknown,
}

/// Where a resolved payload has to be stored.
pub(crate) struct Placement {
    keys: Vec<StoreKey>,
}

pub struct Ingestor {
    config: RepoConfig,
    db: SharedDatabase,
    store: Arc<ContentStore>,
    abort: Arc<AtomicBool>,
    phase: Mutex<IngestPhase>,
    pool: rayon::ThreadPool,
}

impl Ingestor {
    pub fn new(
        config: RepoConfig,
        db: SharedDatabase,
        store: Arc<ContentStore>,
    ) -> Result<Self, Error> {
        let workers = config.worker_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("romvault-ingest-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build worker pool: {}", e)))?;
        debug!("Ingest pool with {} workers", workers);
        Ok(Self {
            config,
            db,
            store,
            abort: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(IngestPhase::Idle),
            pool,
        })
    }

    /// Flag shared with whoever may cancel the run (signal handler, UI).
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> IngestPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(IngestPhase::Idle)
    }

    fn enter(&self, phase: IngestPhase, reporter: &dyn ProgressReporter) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
        info!("{}", phase);
        reporter.on_message(&phase.to_string());
    }

    /// Ingest everything under `roots`.
    pub fn ingest(
        &self,
        roots: &[PathBuf],
        reporter: &dyn ProgressReporter,
    ) -> Result<IngestSummary, Error> {
        let start = Instant::now();
        let mut tally = IngestTally::default();

        self.enter(IngestPhase::Scanning, reporter);
        reporter.on_indeterminate("Scanning");
        let candidates = scanner::list_candidates(roots, &self.config.ignore_patterns)?;
        info!("Found {} candidate files", candidates.len());

        let (plain, archives) = if self.config.scan_archives {
            self.enter(IngestPhase::SeparatingArchives, reporter);
            self.separate(candidates, reporter, &mut tally)
        } else {
            (candidates, Vec::new())
        };

        self.enter(IngestPhase::ImportingPlainFiles, reporter);
        let caches = self.run_phase(&plain, reporter, |cache, candidate| {
            self.import_plain(cache, candidate)
        });
        tally.add(&self.finish_phase(caches)?);

        self.enter(IngestPhase::ImportingArchiveMembers, reporter);
        let caches = self.run_phase(&archives, reporter, |cache, candidate| {
            archive::import_archive(self, cache, candidate, reporter)
        });
        tally.add(&self.finish_phase(caches)?);

        self.enter(IngestPhase::Done, reporter);
        reporter.on_indeterminate("Computing statistics");
        let stats = lock(&self.db)?.refresh_all_romset_stats()?;
        debug!("Recomputed statistics of {} RomSets", stats.len());

        let summary = IngestSummary {
            aborted: self.aborted(),
            duration: start.elapsed(),
            tally,
        };
        info!(
            "Ingest finished in {:.2}s: {} stored, {} already present, {} skipped, {} failed{}",
            summary.duration.as_secs_f64(),
            summary.tally.stored,
            summary.tally.already_present,
            summary.tally.skipped_unknown,
            summary.tally.failed,
            if summary.aborted { " (aborted)" } else { "" }
        );
        reporter.on_finished(&format!(
            "{} stored, {} already present, {} skipped, {} failed",
            summary.tally.stored,
            summary.tally.already_present,
            summary.tally.skipped_unknown,
            summary.tally.failed
        ));
        Ok(summary)
    }

    fn separate(
        &self,
        candidates: Vec<Candidate>,
        reporter: &dyn ProgressReporter,
        tally: &mut IngestTally,
    ) -> (Vec<Candidate>, Vec<Candidate>) {
        let classified: Vec<(Candidate, Result<EntryClass, std::io::Error>)> =
            self.pool.install(|| {
                candidates
                    .into_par_iter()
                    .map(|c| {
                        let class = scanner::classify(&c.path);
                        (c, class)
                    })
                    .collect()
            });

        let mut plain = Vec::new();
        let mut archives = Vec::new();
        for (candidate, class) in classified {
            match class {
                Ok(EntryClass::ZipArchive) => archives.push(candidate),
                Ok(EntryClass::Plain) => plain.push(candidate),
                Err(e) => {
                    let msg = format!("Cannot read {}: {}", candidate.path.display(), e);
                    error!("{}", msg);
                    reporter.on_error(&msg);
                    tally.failed += 1;
                }
            }
        }
        debug!("{} plain files, {} archives", plain.len(), archives.len());
        (plain, archives)
    }

    /// Run `work` over `items` on the pool. Each rayon split folds into its
    /// own cache; the caches come back for the phase merge.
    fn run_phase<F>(
        &self,
        items: &[Candidate],
        reporter: &dyn ProgressReporter,
        work: F,
    ) -> Vec<PendingCache>
    where
        F: Fn(&mut PendingCache, &Candidate) -> Result<(), Error> + Sync,
    {
        reporter.on_bounds(0, items.len() as u64);
        let done = AtomicU64::new(0);

        self.pool.install(|| {
            items
                .par_iter()
                .fold(PendingCache::default, |mut cache, candidate| {
                    if self.aborted() {
                        cache.tally.aborted_items += 1;
                        return cache;
                    }
                    if let Err(e) = work(&mut cache, candidate) {
                        let msg = format!("Failed to ingest {}: {}", candidate.path.display(), e);
                        error!("{}", msg);
                        reporter.on_error(&msg);
                        cache.tally.failed += 1;
                    }
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    reporter.on_progress(n);
                    cache
                })
                .collect()
        })
    }

    /// Merge the caches of a phase, then delete sources that are safe.
    fn finish_phase(&self, caches: Vec<PendingCache>) -> Result<IngestTally, Error> {
        let mut tally = IngestTally::default();
        for cache in &caches {
            tally.add(&cache.tally);
        }
        if caches.iter().all(|c| c.in_repo.is_empty() && c.created.is_empty()) {
            self.delete_sources(&caches, &mut tally);
            return Ok(tally);
        }

        {
            let db = lock(&self.db)?;
            merge_pending(&db, &caches)?;
        }
        self.delete_sources(&caches, &mut tally);
        Ok(tally)
    }

    fn delete_sources(&self, caches: &[PendingCache], tally: &mut IngestTally) {
        for path in caches.iter().flat_map(|c| c.deletions.iter()) {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Deleted source {}", path.display());
                    tally.deleted += 1;
                }
                Err(e) => warn!("Could not delete {}: {}", path.display(), e),
            }
        }
    }

    fn import_plain(&self, cache: &mut PendingCache, candidate: &Candidate) -> Result<(), Error> {
        cache.tally.files += 1;
        let fp = fingerprint_path(&candidate.path)?;
        let outcome = match self.resolve_payload(cache, &fp)? {
            Some(placement) => {
                let mut outcome = PayloadOutcome::AlreadyPresent;
                for key in &placement.keys {
                    if self.store.put_path(&candidate.path, key)? == PutOutcome::Stored {
                        outcome = PayloadOutcome::Stored;
                    }
                }
                outcome
            }
            None => PayloadOutcome::SkippedUnknown,
        };
        self.record_outcome(cache, &fp, outcome);

        let delete = match outcome {
            PayloadOutcome::SkippedUnknown => self.config.delete_unknown,
            _ => self.config.delete_source,
        };
        if delete {
            cache.deletions.push(candidate.path.clone());
        }
        Ok(())
    }

    /// Resolve a fingerprinted payload against the worker cache and the
    /// live index. `None` means known-only mode and no record matched.
    pub(crate) fn resolve_payload(
        &self,
        cache: &mut PendingCache,
        fp: &Fingerprint,
    ) -> Result<Option<Placement>, Error> {
        let hashes = Hashes::from_fingerprint(fp);
        let sha384 = fp.get(HashKind::Sha384).to_string();

        match cache.seen.get(&sha384) {
            Some(SeenPayload::Unknown) => return Ok(None),
            Some(SeenPayload::Stored) => {
                let keys = self.keys_for_cached(cache, &hashes, fp);
                return Ok(Some(Placement { keys }));
            }
            None => {}
        }

        let matches = {
            let db = lock(&self.db)?;
            lookup_payload(&db, &hashes, fp.size())?
        };

        if matches.is_empty() {
            if self.config.known_only {
                return Ok(None);
            }
            cache
                .created
                .push(ContentRecord::new(ItemKind::File, hashes, fp.size()));
            cache.tally.created += 1;
            return Ok(Some(Placement {
                keys: vec![StoreKey::for_fingerprint(ItemKind::File, fp)],
            }));
        }

        cache.tally.matched += 1;
        let mut keys = Vec::with_capacity(matches.len());
        for mut record in matches {
            record.hashes.backfill(&hashes);
            keys.push(StoreKey::for_fingerprint(record.kind, fp));
            cache.mark_in_repo(record);
        }
        // matches come grouped by kind
        keys.dedup();
        Ok(Some(Placement { keys }))
    }

    /// Keys of a payload this worker already placed.
    fn keys_for_cached(&self, cache: &PendingCache, hashes: &Hashes, fp: &Fingerprint) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = cache
            .in_repo
            .values()
            .filter(|r| r.is_identity_of(hashes, fp.size()))
            .map(|r| StoreKey::for_fingerprint(r.kind, fp))
            .collect();
        if keys.is_empty() {
            keys.push(StoreKey::for_fingerprint(ItemKind::File, fp));
        }
        keys.dedup();
        keys
    }

    pub(crate) fn record_outcome(
        &self,
        cache: &mut PendingCache,
        fp: &Fingerprint,
        outcome: PayloadOutcome,
    ) {
        let seen = match outcome {
            PayloadOutcome::Stored => {
                cache.tally.stored += 1;
                SeenPayload::Stored
            }
            PayloadOutcome::AlreadyPresent => {
                cache.tally.already_present += 1;
                SeenPayload::Stored
            }
            PayloadOutcome::SkippedUnknown => {
                cache.tally.skipped_unknown += 1;
                SeenPayload::Unknown
            }
        };
        cache
            .seen
            .insert(fp.get(HashKind::Sha384).to_string(), seen);
    }

    pub(crate) fn store(&self) -> &ContentStore {
        &self.store
    }

    pub(crate) fn db(&self) -> &SharedDatabase {
        &self.db
    }

    pub(crate) fn config(&self) -> &RepoConfig {
        &self.config
    }
}
