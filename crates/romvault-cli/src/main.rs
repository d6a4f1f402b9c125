mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use progress::CliReporter;
use romvault_core::config::{load_configuration, load_configuration_from};
use romvault_core::storage::lock;
use romvault_core::vfs::{FilesystemProvider, NodeKind, RomFs};
use romvault_core::{CatalogImporter, ContentStore, Database, Ingestor, RepoConfig, SharedDatabase};
use tracing::{error, info};

const READ_CHUNK: u32 = 128 * 1024;

fn main() {
    dotenv().ok();

    let args = Cli::parse();

    let loaded = match &args.config {
        Some(path) => load_configuration_from(path),
        None => load_configuration(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {}", "Error loading configuration:".red(), err);
            process::exit(1);
        }
    };

    let _guard = logging::init_logger(&config);

    let result = match args.command {
        Some(Commands::ImportDat { paths }) => run_import(&config, &paths),
        Some(Commands::Ingest {
            paths,
            known_only,
            delete_source,
            delete_unknown,
            no_archives,
        }) => {
            let mut config = config;
            config.known_only |= known_only;
            config.delete_source |= delete_source;
            config.delete_unknown |= delete_unknown;
            config.scan_archives &= !no_archives;
            run_ingest(config, &paths)
        }
        Some(Commands::Stats { refresh }) => run_stats(&config, refresh),
        Some(Commands::Ls { path }) => run_ls(&config, &path),
        Some(Commands::Cat { path }) => run_cat(&config, &path),
        Some(Commands::RemoveRomset { id }) => run_remove(&config, id),
        #[cfg(feature = "fuse")]
        Some(Commands::Mount {
            mountpoint,
            allow_other,
        }) => run_mount(&config, &mountpoint, allow_other),
        Some(Commands::Unmount { mountpoint, token }) => run_unmount(&mountpoint, &token),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:?}", config);
            Ok(())
        }
        Some(Commands::TruncateDb) => run_truncate(&config),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn open_repository(config: &RepoConfig) -> Result<(SharedDatabase, Arc<ContentStore>)> {
    let store = Arc::new(ContentStore::open(config).context("Failed to open content store")?);
    let db_path = config.database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    Ok((db.into_shared(), store))
}

fn run_import(config: &RepoConfig, paths: &[PathBuf]) -> Result<()> {
    let (db, store) = open_repository(config)?;
    let importer = CatalogImporter::new(db, store);
    let reporter = CliReporter::new();

    for path in paths {
        let summary = importer
            .import_file(path, &reporter)
            .with_context(|| format!("Failed to import {}", path.display()))?;
        if summary.already_imported {
            info!(
                "{} is already RomSet {}",
                path.display(),
                summary.romset_id.to_string().yellow()
            );
            continue;
        }
        info!(
            "RomSet {}: {} machines, {} items",
            summary.romset_id.to_string().cyan(),
            summary.machines,
            summary.items
        );
        info!(
            "{} new records, {} matched, {} backfilled",
            summary.new_records.to_string().green(),
            summary.matched_records,
            summary.updated_records
        );
        if let Some(stat) = &summary.stat {
            info!(
                "{} of {} items present",
                stat.have_items.to_string().green(),
                stat.total_items
            );
        }
    }
    Ok(())
}

fn run_ingest(config: RepoConfig, paths: &[PathBuf]) -> Result<()> {
    let (db, store) = open_repository(&config)?;
    let ingestor = Ingestor::new(config, db, store)?;
    let reporter = CliReporter::new();
    let summary = ingestor.ingest(paths, &reporter)?;
    let tally = &summary.tally;

    println!();
    info!(
        "{} files, {} archives ({} members) in {}",
        tally.files,
        tally.archives,
        tally.members,
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
    );
    info!(
        "{} stored, {} already present, {} matched, {} new",
        tally.stored.to_string().green(),
        tally.already_present,
        tally.matched.to_string().cyan(),
        tally.created,
    );
    if tally.skipped_unknown > 0 || tally.failed > 0 {
        info!(
            "{} skipped as unknown, {} failed",
            tally.skipped_unknown.to_string().yellow(),
            tally.failed.to_string().red(),
        );
    }
    if tally.deleted > 0 {
        info!("{} sources deleted", tally.deleted);
    }
    if summary.aborted {
        bail!("Ingest aborted; {} items not processed", tally.aborted_items);
    }
    Ok(())
}

fn run_stats(config: &RepoConfig, refresh: bool) -> Result<()> {
    let (db, _store) = open_repository(config)?;
    let db = lock(&db)?;
    if refresh {
        db.refresh_all_romset_stats()?;
    }

    for romset in db.list_romsets()? {
        let stat = match db.get_romset_stat(romset.id)? {
            Some(stat) => stat,
            None => db.refresh_romset_stat(romset.id)?,
        };
        let have = if stat.miss_items == 0 {
            stat.have_items.to_string().green()
        } else {
            stat.have_items.to_string().yellow()
        };
        println!(
            "{:>5}  {}  machines {}/{}  items {}/{}  missing {}",
            romset.id,
            romset.name.bold(),
            stat.complete_machines,
            stat.total_machines,
            have,
            stat.total_items,
            stat.miss_items.to_string().red(),
        );
    }

    let (count, bytes) = db.repository_totals()?;
    println!("{} payloads in the store, {} bytes", count.to_string().cyan(), bytes);
    Ok(())
}

fn run_ls(config: &RepoConfig, path: &str) -> Result<()> {
    let (db, store) = open_repository(config)?;
    let fs = RomFs::new(db, store);
    let handle = fs.opendir(path)?;
    let entries = fs.readdir(handle);
    fs.releasedir(handle)?;

    for entry in entries? {
        match entry.kind {
            NodeKind::Directory => println!("{}/", entry.name.blue()),
            NodeKind::RegularFile => {
                let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                let size = fs.stat(&child).map(|a| a.size).unwrap_or(0);
                println!("{:>12}  {}", size, entry.name);
            }
        }
    }
    Ok(())
}

fn run_cat(config: &RepoConfig, path: &str) -> Result<()> {
    let (db, store) = open_repository(config)?;
    let fs = RomFs::new(db, store);
    let handle = fs.open(path, libc::O_RDONLY)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0u64;
    let result = loop {
        match fs.read(handle, offset, READ_CHUNK) {
            Ok(chunk) if chunk.is_empty() => break Ok(()),
            Ok(chunk) => {
                offset += chunk.len() as u64;
                if let Err(e) = out.write_all(&chunk) {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(anyhow::Error::from(e)),
        }
    };
    fs.release(handle)?;
    out.flush()?;
    result
}

fn run_remove(config: &RepoConfig, id: i64) -> Result<()> {
    let (db, store) = open_repository(config)?;
    let importer = CatalogImporter::new(db, store);
    if importer.remove_romset(id)? {
        info!("RomSet {} removed", id);
    } else {
        bail!("No RomSet with id {}", id);
    }
    Ok(())
}

#[cfg(feature = "fuse")]
fn run_mount(config: &RepoConfig, mountpoint: &Path, allow_other: bool) -> Result<()> {
    use romvault_core::vfs::fuse::{mount, MountOptions};

    let (db, store) = open_repository(config)?;
    let fs = Arc::new(RomFs::new(db, store));
    let token = fs.issue_unmount_token();
    println!("Unmount token: {}", token.bold());
    println!(
        "Run `romvault unmount {} {}` to unmount",
        mountpoint.display(),
        token
    );

    let options = MountOptions {
        allow_other,
        ..MountOptions::default()
    };
    mount(fs, mountpoint, &options)
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;
    info!("Unmounted {}", mountpoint.display());
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_unmount(mountpoint: &Path, token: &str) -> Result<()> {
    use romvault_core::vfs::{CONTROL_FILE, UNMOUNT_XATTR};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let control = mountpoint.join(CONTROL_FILE);
    let path = CString::new(control.as_os_str().as_bytes())?;
    let name = CString::new(UNMOUNT_XATTR)?;
    // SAFETY: both strings are NUL-terminated and outlive the call
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            token.as_ptr() as *const libc::c_void,
            token.len(),
            0,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        bail!("Unmount request rejected by {}: {}", mountpoint.display(), err);
    }
    info!("Unmount requested for {}", mountpoint.display());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_unmount(mountpoint: &Path, _token: &str) -> Result<()> {
    bail!(
        "Unmount requests are not supported on this platform; unmount {} with the system tools",
        mountpoint.display()
    )
}

fn run_truncate(config: &RepoConfig) -> Result<()> {
    match prompt_confirm(
        "Are you SURE you want to COMPLETELY DELETE the Database?",
        Some(false),
    ) {
        Ok(true) => {
            let (db, _store) = open_repository(config)?;
            lock(&db)?.truncate_all()?;
            println!("All tables truncated");
        }
        _ => process::exit(0),
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
