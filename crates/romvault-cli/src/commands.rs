use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "romvault")]
#[command(about = "Content-addressed ROM repository", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to Romvault.toml and ROMVAULT_* variables)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import a JSON DAT catalog as a new RomSet
    ImportDat {
        /// Catalog files to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Store every payload found under the given folders
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Only store payloads some catalog describes
        #[arg(long)]
        known_only: bool,
        /// Delete sources once their payload is stored
        #[arg(long)]
        delete_source: bool,
        /// With --known-only, also delete sources that match nothing
        #[arg(long, requires = "known_only")]
        delete_unknown: bool,
        /// Do not look inside zip archives
        #[arg(long)]
        no_archives: bool,
    },
    /// Show completeness of every RomSet
    Stats {
        /// Recompute the statistics before printing
        #[arg(long)]
        refresh: bool,
    },
    /// List a directory of the repository view
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write an item of the repository view to stdout
    Cat { path: String },
    /// Delete a RomSet and its machines
    RemoveRomset { id: i64 },
    /// Mount the repository read-only
    #[cfg(feature = "fuse")]
    Mount {
        mountpoint: PathBuf,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },
    /// Ask a running mount to unmount itself
    Unmount {
        mountpoint: PathBuf,
        /// Token printed when the filesystem was mounted
        token: String,
    },
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}
