use crate::error::Error;
use rusqlite::{Connection, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const SCHEMA_VERSION: i64 = 1;

pub struct Database {
    conn: Connection,
}

/// The index as shared by the ingestor workers and the filesystem adapter.
/// One coarse lock per unit of work.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn lock(db: &SharedDatabase) -> std::result::Result<MutexGuard<'_, Database>, Error> {
    db.lock()
        .map_err(|e| Error::Other(format!("Failed to lock database: {}", e)))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 64MB cache)");
        Ok(())
    }

    fn migrate_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            debug!(
                "Schema version {} is newer than {}, opening as-is",
                version, SCHEMA_VERSION
            );
            return Ok(());
        }

        self.conn.execute_batch(include_str!("schema.sql"))?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn truncate_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM romset_stat;
             DELETE FROM file_by_machine;
             DELETE FROM disk_by_machine;
             DELETE FROM media_by_machine;
             DELETE FROM machine;
             DELETE FROM romset;
             DELETE FROM file;
             DELETE FROM disk;
             DELETE FROM media;",
        )?;
        debug!("All tables truncated");
        Ok(())
    }
}
