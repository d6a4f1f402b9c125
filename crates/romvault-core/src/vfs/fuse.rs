//! `fuser` binding of [`RomFs`].
//!
//! The kernel speaks inodes, the provider speaks paths; this adapter keeps
//! the mapping. An inode is assigned on lookup and dropped once the kernel
//! forgets every lookup of it, so the table tracks the kernel's cache
//! rather than everything ever listed.

use super::error::FsError;
use super::provider::{FileAttr, FilesystemProvider, NodeKind};
use super::romfs::RomFs;
use dashmap::DashMap;
use fuser::{
    FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace};

const ROOT_INO: u64 = 1;
/// `d_ino` for directory entries not looked up yet.
const UNKNOWN_INO: u64 = 0xffff_ffff;
const TTL: Duration = Duration::from_secs(1);

/// Inode <-> path table with the kernel's lookup count per inode.
struct InodeTable {
    paths: DashMap<u64, String>,
    inodes: DashMap<String, u64>,
    lookups: DashMap<u64, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let table = Self {
            paths: DashMap::new(),
            inodes: DashMap::new(),
            lookups: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.paths.insert(ROOT_INO, "/".to_string());
        table.inodes.insert("/".to_string(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).map(|p| p.clone())
    }

    fn known(&self, path: &str) -> Option<u64> {
        self.inodes.get(path).map(|ino| *ino)
    }

    /// Inode of `path`, counting one kernel lookup on it.
    fn lookup(&self, path: &str) -> u64 {
        let ino = match self.known(path) {
            Some(ino) => ino,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                self.inodes.insert(path.to_string(), ino);
                self.paths.insert(ino, path.to_string());
                ino
            }
        };
        *self.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let remaining = match self.lookups.get_mut(&ino) {
            Some(mut count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.lookups.remove(&ino);
            if let Some((_, path)) = self.paths.remove(&ino) {
                self.inodes.remove(&path);
            }
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

pub struct FuseAdapter {
    fs: Arc<RomFs>,
    table: InodeTable,
    uid: u32,
    gid: u32,
}

impl From<NodeKind> for FileType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Directory => FileType::Directory,
            NodeKind::RegularFile => FileType::RegularFile,
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl FuseAdapter {
    pub fn new(fs: Arc<RomFs>) -> Self {
        // SAFETY: getuid/getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            fs,
            table: InodeTable::new(),
            uid,
            gid,
        }
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.table.path(ino)
    }

    fn to_fuser(&self, ino: u64, attr: &FileAttr) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            kind: attr.kind.into(),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("Filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Filesystem unmounted");
        self.fs.mark_unmounted();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (Some(parent_path), Some(name)) = (self.path(parent), name.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join(&parent_path, name);
        match self.fs.stat(&path) {
            Ok(attr) => {
                let ino = self.table.lookup(&path);
                reply.entry(&TTL, &self.to_fuser(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.table.forget(ino, nlookup);
        trace!("forget {} ({}), {} inodes held", ino, nlookup, self.table.len());
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.stat(&path) {
            Ok(attr) => reply.attr(&TTL, &self.to_fuser(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.fs.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.opendir(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let (Some(path), true) = (self.path(ino), offset >= 0) else {
            reply.error(libc::EINVAL);
            return;
        };
        let listing = match self.fs.readdir(fh) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        // readdir does not count as a lookup, so nothing is assigned here
        let parent_ino = self.table.known(parent_of(&path)).unwrap_or(UNKNOWN_INO);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in listing {
            let child = self
                .table
                .known(&join(&path, &entry.name))
                .unwrap_or(UNKNOWN_INO);
            entries.push((child, entry.kind.into(), entry.name));
        }

        for (i, (child, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.bsize,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(path), Some(name)) = (self.path(ino), name.to_str()) else {
            reply.error(libc::EROFS);
            return;
        };
        match self.fs.setxattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (Some(path), Some(name)) = (self.path(ino), name.to_str()) else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.fs.getxattr(&path, name) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.listxattr(&path) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                reply_xattr(reply, size, &buf);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(FsError::ReadOnly.errno());
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(FsError::ReadOnly.errno());
    }
}

fn reply_xattr(reply: ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() as u32 > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub fsname: String,
    pub allow_other: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fsname: "romvault".to_string(),
            allow_other: false,
        }
    }
}

/// Mount `fs` and block until an unmount is requested through the control
/// file or the filesystem is unmounted externally.
pub fn mount(fs: Arc<RomFs>, mountpoint: &Path, options: &MountOptions) -> io::Result<()> {
    // no RO option: the kernel would then refuse the control-file setxattr
    // before it reaches us. Every mutation already answers EROFS.
    let mut mount_options = vec![
        MountOption::FSName(options.fsname.clone()),
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    let session = fuser::spawn_mount2(FuseAdapter::new(Arc::clone(&fs)), mountpoint, &mount_options)?;
    info!("Mounted at {}", mountpoint.display());
    fs.wait_for_unmount(None);
    debug!("Unmounting {}", mountpoint.display());
    drop(session);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
    }

    #[test]
    fn test_inodes_live_until_forgotten() {
        let table = InodeTable::new();
        let a = table.lookup("/A");
        assert_eq!(table.lookup("/A"), a);
        let m = table.lookup("/A/M1");
        assert_ne!(a, m);
        assert_eq!(table.len(), 3);

        table.forget(a, 1);
        assert_eq!(table.path(a).as_deref(), Some("/A"));
        table.forget(a, 1);
        assert_eq!(table.path(a), None);
        assert_eq!(table.known("/A"), None);
        assert_eq!(table.known("/A/M1"), Some(m));

        // a fresh lookup gets a fresh inode
        assert_ne!(table.lookup("/A"), a);
    }

    #[test]
    fn test_root_is_never_forgotten() {
        let table = InodeTable::new();
        table.forget(ROOT_INO, 10);
        assert_eq!(table.path(ROOT_INO).as_deref(), Some("/"));
        assert_eq!(table.len(), 1);
    }
}
