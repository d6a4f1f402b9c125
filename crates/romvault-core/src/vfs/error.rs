use crate::error::Error;
use thiserror::Error;

/// Errors of the filesystem adapter. Each maps to one errno value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,

    #[error("Is a directory")]
    IsDirectory,

    #[error("Not a directory")]
    NotDirectory,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Read-only file system")]
    ReadOnly,

    #[error("Bad file handle")]
    BadHandle,

    #[error("No such attribute")]
    NoAttribute,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadHandle => libc::EBADF,
            FsError::NoAttribute => libc::ENODATA,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<Error> for FsError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(_) => FsError::NotFound,
            other => FsError::Io(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}
