use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Item references unknown machine '{machine}' in catalog '{catalog}'")]
    UnknownMachine { machine: String, catalog: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that only concern a single item of a larger batch.
    pub fn is_per_item(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Archive(_) | Error::NotFound(_))
    }
}
