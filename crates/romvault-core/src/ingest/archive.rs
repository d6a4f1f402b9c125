use super::pending::{crc_is_known, PendingCache};
use super::{Ingestor, PayloadOutcome};
use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::scanner::Candidate;
use crate::storage::lock;
use crate::store::PutOutcome;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use tracing::{debug, error, trace};
use zip::ZipArchive;

/// Import every member of one zip. Member failures are reported and
/// counted; the archive itself only fails when it cannot be opened.
pub(crate) fn import_archive(
    ingestor: &Ingestor,
    cache: &mut PendingCache,
    candidate: &Candidate,
    reporter: &dyn ProgressReporter,
) -> Result<(), Error> {
    cache.tally.archives += 1;
    let file = File::open(&candidate.path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    debug!(
        "{}: {} entries",
        candidate.path.display(),
        archive.len()
    );

    let mut failed = 0usize;
    let mut unknown = 0usize;
    for index in 0..archive.len() {
        match import_member(ingestor, cache, &mut archive, index) {
            Ok(Some(PayloadOutcome::SkippedUnknown)) => unknown += 1,
            Ok(_) => {}
            Err(e) => {
                failed += 1;
                cache.tally.failed += 1;
                let msg = format!(
                    "Failed to ingest member {} of {}: {}",
                    index,
                    candidate.path.display(),
                    e
                );
                error!("{}", msg);
                reporter.on_error(&msg);
            }
        }
    }

    let config = ingestor.config();
    let delete = failed == 0
        && config.delete_source
        && (unknown == 0 || config.delete_unknown);
    if delete {
        cache.deletions.push(candidate.path.clone());
    }
    Ok(())
}

/// `None` for directory entries.
fn import_member<R: Read + Seek>(
    ingestor: &Ingestor,
    cache: &mut PendingCache,
    archive: &mut ZipArchive<R>,
    index: usize,
) -> Result<Option<PayloadOutcome>, Error> {
    let mut entry = archive.by_index(index)?;
    if entry.is_dir() {
        return Ok(None);
    }
    cache.tally.members += 1;
    let size = entry.size();
    let name = entry.name().to_string();

    // central directory CRC first: unknown members are never decompressed
    if ingestor.config().known_only {
        let crc = format!("{:08x}", entry.crc32());
        let known = {
            let db = lock(ingestor.db())?;
            crc_is_known(&db, &crc, size)?
        };
        if !known {
            trace!("{}: crc {} size {} not in index", name, crc, size);
            cache.tally.skipped_unknown += 1;
            return Ok(Some(PayloadOutcome::SkippedUnknown));
        }
    }

    let staged = ingestor.store().stage(&mut entry)?;
    let fp = staged.fingerprint().clone();
    if fp.size() != size {
        return Err(Error::Other(format!(
            "{}: archive declares {} bytes, read {}",
            name,
            size,
            fp.size()
        )));
    }

    let outcome = match ingestor.resolve_payload(cache, &fp)? {
        // staged file is discarded on drop
        None => PayloadOutcome::SkippedUnknown,
        Some(placement) => {
            let outcomes = ingestor.store().commit(staged, &placement.keys)?;
            if outcomes.contains(&PutOutcome::Stored) {
                PayloadOutcome::Stored
            } else {
                PayloadOutcome::AlreadyPresent
            }
        }
    };
    ingestor.record_outcome(cache, &fp, outcome);
    trace!("{}: {:?}", name, outcome);
    Ok(Some(outcome))
}
