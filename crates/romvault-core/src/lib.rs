pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod hasher;
pub mod ingest;
pub mod progress;
pub mod scanner;
pub mod storage;
pub mod store;
pub mod vfs;

pub use catalog::{CatalogImporter, ImportSummary};
pub use config::RepoConfig;
pub use domain::{Hashes, ItemKind};
pub use error::Error;
pub use ingest::{IngestPhase, IngestSummary, Ingestor};
pub use progress::{ProgressReporter, SilentReporter};
pub use storage::{Database, SharedDatabase};
pub use store::ContentStore;
