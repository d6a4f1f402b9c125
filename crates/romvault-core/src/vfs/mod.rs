//! Read-only view of the repository as a filesystem.
//!
//! ```text
//! /<RomSet>/<Machine>/<item path>
//! ```
//!
//! [`RomFs`] answers path-based requests; the optional `fuse` feature binds
//! it to the kernel through `fuser`.

pub mod error;
pub mod provider;
pub mod romfs;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use error::{FsError, FsResult};
pub use provider::{DirEntry, FileAttr, FilesystemProvider, NodeKind, StatFs};
pub use romfs::{Node, RomFs, CONTROL_FILE, UNMOUNT_XATTR};
