use super::error::{FsError, FsResult};
use std::time::SystemTime;

pub const BLOCK_SIZE: u64 = 512;
pub const DIR_MODE: u16 = 0o555;
pub const FILE_MODE: u16 = 0o444;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

/// Attributes of one node, independent of any kernel binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: NodeKind,
    pub size: u64,
    /// 512-byte blocks.
    pub blocks: u64,
    pub perm: u16,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl FileAttr {
    pub fn directory(created: SystemTime, modified: SystemTime) -> Self {
        Self {
            kind: NodeKind::Directory,
            size: 0,
            blocks: 0,
            perm: DIR_MODE,
            nlink: 2,
            atime: modified,
            mtime: modified,
            ctime: modified,
            crtime: created,
        }
    }

    pub fn file(size: u64, created: SystemTime, modified: SystemTime) -> Self {
        Self {
            kind: NodeKind::RegularFile,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            perm: FILE_MODE,
            nlink: 1,
            atime: modified,
            mtime: modified,
            ctime: modified,
            crtime: created,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Flags that express an intent to modify: write access mode, append,
/// create, exclusive or truncate.
pub fn has_write_intent(flags: i32) -> bool {
    let access = flags & libc::O_ACCMODE;
    access != libc::O_RDONLY
        || flags & (libc::O_APPEND | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC) != 0
}

/// The operations a host filesystem binding forwards to the repository.
///
/// Paths are absolute and `/`-separated. Every mutating operation has a
/// default that returns [`FsError::ReadOnly`]; implementations only add
/// the read side (and `setxattr` for control requests).
pub trait FilesystemProvider: Send + Sync {
    fn stat(&self, path: &str) -> FsResult<FileAttr>;
    fn open(&self, path: &str, flags: i32) -> FsResult<u64>;
    fn read(&self, handle: u64, offset: u64, size: u32) -> FsResult<Vec<u8>>;
    fn release(&self, handle: u64) -> FsResult<()>;
    fn opendir(&self, path: &str) -> FsResult<u64>;
    fn readdir(&self, handle: u64) -> FsResult<Vec<DirEntry>>;
    fn releasedir(&self, handle: u64) -> FsResult<()>;
    fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>>;
    fn listxattr(&self, path: &str) -> FsResult<Vec<String>>;
    fn statfs(&self) -> FsResult<StatFs>;

    fn setxattr(&self, _path: &str, _name: &str, _value: &[u8]) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn removexattr(&self, _path: &str, _name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn create(&self, _path: &str, _mode: u32) -> FsResult<u64> {
        Err(FsError::ReadOnly)
    }

    fn write(&self, _handle: u64, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::ReadOnly)
    }

    fn truncate(&self, _path: &str, _size: u64) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn rename(&self, _from: &str, _to: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn chmod(&self, _path: &str, _mode: u32) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn chown(&self, _path: &str, _uid: Option<u32>, _gid: Option<u32>) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn set_times(
        &self,
        _path: &str,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn unlink(&self, _path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn rmdir(&self, _path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_intent_flags() {
        assert!(!has_write_intent(libc::O_RDONLY));
        assert!(has_write_intent(libc::O_WRONLY));
        assert!(has_write_intent(libc::O_RDWR));
        assert!(has_write_intent(libc::O_RDONLY | libc::O_APPEND));
        assert!(has_write_intent(libc::O_RDONLY | libc::O_CREAT));
        assert!(has_write_intent(libc::O_RDONLY | libc::O_TRUNC));
    }

    #[test]
    fn test_file_blocks_round_up() {
        let now = SystemTime::now();
        assert_eq!(FileAttr::file(0, now, now).blocks, 0);
        assert_eq!(FileAttr::file(1, now, now).blocks, 1);
        assert_eq!(FileAttr::file(1024, now, now).blocks, 2);
        assert_eq!(FileAttr::file(1025, now, now).blocks, 3);
    }
}
