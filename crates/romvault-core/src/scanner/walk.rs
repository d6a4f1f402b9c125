use glob::Pattern;
use rayon::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, warn};
use walkdir::WalkDir;

/// A regular file found under an ingest root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
}

pub fn compile_patterns(ignore_globs: &[String]) -> Vec<Pattern> {
    ignore_globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect()
}

fn is_ignored(path: &Path, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches_path(path)
            || path
                .file_name()
                .map(|name| pattern.matches(&name.to_string_lossy()))
                .unwrap_or(false)
    })
}

/// Recursive listing of every regular file under `roots`, sorted by path.
/// Ignored directories are pruned; symlinks are not followed. Unreadable
/// entries are logged and skipped, a missing root is an error.
pub fn list_candidates(roots: &[PathBuf], ignore_globs: &[String]) -> io::Result<Vec<Candidate>> {
    let patterns = compile_patterns(ignore_globs);

    for root in roots {
        if !root.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Ingest root {} does not exist", root.display()),
            ));
        }
    }

    let mut candidates: Vec<Candidate> = roots
        .par_iter()
        .flat_map_iter(|root| walk_root(root, &patterns))
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates.dedup_by(|a, b| a.path == b.path);
    Ok(candidates)
}

fn walk_root(root: &Path, patterns: &[Pattern]) -> Vec<Candidate> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored(entry.path(), patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => found.push(Candidate {
                path: entry.into_path(),
                size: metadata.len(),
            }),
            Err(err) => warn!("Error getting metadata for {}: {}", entry.path().display(), err),
        }
    }
    found
}
