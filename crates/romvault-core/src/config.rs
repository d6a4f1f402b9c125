use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_DATABASE_FILE: &str = "romvault.db";
const DEFAULT_COMPRESSION_LEVEL: i32 = 9;
const DEFAULT_LOG_FILE: &str = "logs/romvault.log";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Everything the core needs to know about one repository.
///
/// Built once (from `Romvault.toml` / `ROMVAULT_*` variables, or by hand in
/// tests) and handed to each component by reference.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub repository_path: PathBuf,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub temp_path: Option<PathBuf>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Only store payloads the catalog index already describes.
    #[serde(default)]
    pub known_only: bool,
    /// Delete ingested sources once their payload is safely in the store.
    #[serde(default)]
    pub delete_source: bool,
    /// In known-only mode, also delete sources that match nothing.
    #[serde(default)]
    pub delete_unknown: bool,
    #[serde(default = "default_true")]
    pub scan_archives: bool,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Log file; relative to the repository unless absolute.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// `EnvFilter` directive, e.g. `info` or `romvault_core=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl RepoConfig {
    pub fn new<P: Into<PathBuf>>(repository_path: P) -> Self {
        Self {
            repository_path: repository_path.into(),
            database_path: None,
            temp_path: None,
            ignore_patterns: Vec::new(),
            known_only: false,
            delete_source: false,
            delete_unknown: false,
            scan_archives: true,
            workers: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            log_path: None,
            log_level: default_log_level(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.repository_path.join(DEFAULT_DATABASE_FILE))
    }

    /// Staging directory. Must live on the same filesystem as the store so
    /// staged payloads can be published by rename.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_path
            .clone()
            .unwrap_or_else(|| self.repository_path.join("tmp"))
    }

    pub fn log_file(&self) -> PathBuf {
        match &self.log_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.repository_path.join(path),
            None => self.repository_path.join(DEFAULT_LOG_FILE),
        }
    }

    /// Worker pool size, bounded by the available cores.
    pub fn worker_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self.workers {
            Some(n) if n > 0 => n.min(available),
            _ => available,
        }
    }
}

pub fn load_configuration() -> Result<RepoConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Romvault").required(false))
        .add_source(Environment::with_prefix("ROMVAULT").try_parsing(true))
        .build()?;
    builder.try_deserialize::<RepoConfig>()
}

pub fn load_configuration_from(path: &Path) -> Result<RepoConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::from(path))
        .build()?;
    builder.try_deserialize::<RepoConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_derive_from_repository_path() {
        let config = RepoConfig::new("/srv/roms");
        assert_eq!(config.database_path(), PathBuf::from("/srv/roms/romvault.db"));
        assert_eq!(config.temp_dir(), PathBuf::from("/srv/roms/tmp"));
        assert!(config.scan_archives);
        assert!(!config.known_only);
        assert_eq!(config.log_file(), PathBuf::from("/srv/roms/logs/romvault.log"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_relative_log_path_lives_in_repository() {
        let mut config = RepoConfig::new("/srv/roms");
        config.log_path = Some(PathBuf::from("ingest.log"));
        assert_eq!(config.log_file(), PathBuf::from("/srv/roms/ingest.log"));
        config.log_path = Some(PathBuf::from("/var/log/romvault.log"));
        assert_eq!(config.log_file(), PathBuf::from("/var/log/romvault.log"));
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let mut config = RepoConfig::new("/srv/roms");
        config.workers = Some(100_000);
        assert!(config.worker_count() >= 1);
        assert!(config.worker_count() < 100_000);

        config.workers = Some(0);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_load_configuration_from_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Romvault.toml");
        fs::write(
            &path,
            "repository_path = \"/data/repo\"\nknown_only = true\nignore_patterns = [\"*.txt\"]\nlog_level = \"debug\"\n",
        )
        .unwrap();

        let config = load_configuration_from(&path).unwrap();
        assert_eq!(config.repository_path, PathBuf::from("/data/repo"));
        assert!(config.known_only);
        assert!(config.scan_archives);
        assert_eq!(config.ignore_patterns, vec!["*.txt".to_string()]);
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(config.log_level, "debug");
    }
}
