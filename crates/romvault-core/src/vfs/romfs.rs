use super::error::{FsError, FsResult};
use super::provider::{
    has_write_intent, DirEntry, FileAttr, FilesystemProvider, NodeKind, StatFs, BLOCK_SIZE,
};
use crate::hasher::HashKind;
use crate::storage::models::{Machine, MachineItem, RomSet};
use crate::storage::{lock, SharedDatabase};
use crate::store::{ContentStore, ForwardSeekReader, StoredReader};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// Hidden file that accepts the unmount request.
pub const CONTROL_FILE: &str = ".romvault-control";
pub const UNMOUNT_XATTR: &str = "user.romvault.unmount";
pub const XATTR_PREFIX: &str = "user.romvault.";

const MAX_DEPTH: usize = 3;

/// A path resolved into the catalog hierarchy.
#[derive(Debug, Clone)]
pub enum Node {
    Root,
    RomSet(RomSet),
    Machine(RomSet, Machine),
    Item(MachineItem),
    Control,
}

struct OpenFile {
    size: u64,
    /// `None` when the payload is not in the store.
    reader: Mutex<Option<ForwardSeekReader<StoredReader>>>,
}

#[derive(Default)]
struct UnmountState {
    token: Option<String>,
    requested: bool,
}

/// Read-only view of the repository: `/<romset>/<machine>/<item>`.
pub struct RomFs {
    db: SharedDatabase,
    store: Arc<ContentStore>,
    mounted_at: SystemTime,
    next_handle: AtomicU64,
    files: DashMap<u64, OpenFile>,
    dirs: DashMap<u64, Vec<DirEntry>>,
    unmount: Mutex<UnmountState>,
    unmount_signal: Condvar,
}

fn to_system_time(t: DateTime<Utc>) -> SystemTime {
    SystemTime::from(t)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split(|c: char| c == '/' || c == '\\')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Folder names of all RomSets. Duplicate names get their id appended.
fn romset_folders(romsets: Vec<RomSet>) -> Vec<(String, RomSet)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for r in &romsets {
        *counts.entry(r.name.clone()).or_default() += 1;
    }
    romsets
        .into_iter()
        .map(|r| {
            let folder = if counts.get(&r.name).copied().unwrap_or(0) > 1 {
                format!("{} ({})", r.name, r.id)
            } else {
                r.name.clone()
            };
            (folder.replace(|c: char| c == '/' || c == '\\', "_"), r)
        })
        .collect()
}

/// Display names of one machine's items. A name already taken in the
/// machine gets the association id inserted before its extension.
fn item_entries(items: Vec<MachineItem>) -> Vec<(String, MachineItem)> {
    let mut taken: HashSet<String> = HashSet::new();
    items
        .into_iter()
        .map(|item| {
            let mut name = item.display_name();
            if !taken.insert(name.clone()) {
                let renamed = with_discriminator(&name, item.association.id);
                debug!("Item name '{}' already used, shown as '{}'", name, renamed);
                taken.insert(renamed.clone());
                name = renamed;
            }
            (name, item)
        })
        .collect()
}

fn with_discriminator(name: &str, id: i64) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], id, &name[dot..]),
        _ => format!("{} ({})", name, id),
    }
}

impl RomFs {
    pub fn new(db: SharedDatabase, store: Arc<ContentStore>) -> Self {
        Self {
            db,
            store,
            mounted_at: SystemTime::now(),
            next_handle: AtomicU64::new(1),
            files: DashMap::new(),
            dirs: DashMap::new(),
            unmount: Mutex::new(UnmountState::default()),
            unmount_signal: Condvar::new(),
        }
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn resolve(&self, path: &str) -> FsResult<Node> {
        let segments = split_path(path);
        if segments.len() > MAX_DEPTH {
            return Err(FsError::NotSupported);
        }
        if segments.is_empty() {
            return Ok(Node::Root);
        }
        if segments.len() == 1 && segments[0] == CONTROL_FILE {
            return Ok(Node::Control);
        }

        let db = lock(&self.db)?;
        let romset = romset_folders(db.list_romsets()?)
            .into_iter()
            .find(|(folder, _)| folder == segments[0])
            .map(|(_, r)| r)
            .ok_or(FsError::NotFound)?;
        if segments.len() == 1 {
            return Ok(Node::RomSet(romset));
        }

        let machine = db
            .find_machine(romset.id, segments[1])?
            .ok_or(FsError::NotFound)?;
        if segments.len() == 2 {
            return Ok(Node::Machine(romset, machine));
        }

        // machine_items lists files, then disks, then medias
        item_entries(db.machine_items(machine.id)?)
            .into_iter()
            .find(|(name, _)| name == segments[2])
            .map(|(_, item)| Node::Item(item))
            .ok_or(FsError::NotFound)
    }

    fn attr_of(&self, node: &Node) -> FileAttr {
        match node {
            Node::Root => FileAttr::directory(self.mounted_at, self.mounted_at),
            Node::RomSet(r) => {
                FileAttr::directory(to_system_time(r.created_at), to_system_time(r.updated_at))
            }
            Node::Machine(_, m) => {
                FileAttr::directory(to_system_time(m.created_at), to_system_time(m.updated_at))
            }
            Node::Item(item) => FileAttr::file(
                item.record.size,
                to_system_time(item.record.created_at),
                to_system_time(item.modified_at()),
            ),
            Node::Control => FileAttr::file(0, self.mounted_at, self.mounted_at),
        }
    }

    fn list(&self, node: &Node) -> FsResult<Vec<DirEntry>> {
        let db = lock(&self.db)?;
        let entries = match node {
            Node::Root => romset_folders(db.list_romsets()?)
                .into_iter()
                .map(|(name, _)| DirEntry {
                    name,
                    kind: NodeKind::Directory,
                })
                .collect(),
            Node::RomSet(r) => db
                .list_machines(r.id)?
                .into_iter()
                .map(|m| DirEntry {
                    name: m.name,
                    kind: NodeKind::Directory,
                })
                .collect(),
            Node::Machine(_, m) => item_entries(db.machine_items(m.id)?)
                .into_iter()
                .map(|(name, _)| DirEntry {
                    name,
                    kind: NodeKind::RegularFile,
                })
                .collect(),
            Node::Item(_) | Node::Control => return Err(FsError::NotDirectory),
        };
        Ok(entries)
    }

    /// Issue the one-time unmount token. Any earlier token is replaced.
    pub fn issue_unmount_token(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{:?}:{}:{}:{:p}",
            SystemTime::now(),
            std::process::id(),
            self.allocate_handle(),
            self as *const Self
        ));
        let token = hex::encode(&hasher.finalize()[..16]);
        if let Ok(mut state) = self.unmount.lock() {
            state.token = Some(token.clone());
        }
        token
    }

    pub fn unmount_requested(&self) -> bool {
        self.unmount.lock().map(|s| s.requested).unwrap_or(false)
    }

    /// Block until an unmount is requested or `timeout` elapses.
    pub fn wait_for_unmount(&self, timeout: Option<Duration>) -> bool {
        let Ok(mut state) = self.unmount.lock() else {
            return false;
        };
        while !state.requested {
            state = match timeout {
                Some(t) => match self.unmount_signal.wait_timeout(state, t) {
                    Ok((guard, result)) => {
                        if result.timed_out() {
                            return guard.requested;
                        }
                        guard
                    }
                    Err(_) => return false,
                },
                None => match self.unmount_signal.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => return false,
                },
            };
        }
        true
    }

    fn request_unmount(&self, value: &[u8]) -> FsResult<()> {
        let offered = String::from_utf8_lossy(value);
        let offered = offered.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        let mut state = self
            .unmount
            .lock()
            .map_err(|_| FsError::Io("unmount state poisoned".to_string()))?;
        match state.token.as_deref() {
            Some(token) if token == offered => {
                state.token = None;
                state.requested = true;
                self.unmount_signal.notify_all();
                info!("Unmount requested through control file");
                Ok(())
            }
            _ => {
                warn!("Rejected unmount request with invalid token");
                Err(FsError::PermissionDenied)
            }
        }
    }

    /// Wake any waiter after the host unmounted the filesystem on its own.
    pub fn mark_unmounted(&self) {
        if let Ok(mut state) = self.unmount.lock() {
            state.token = None;
            state.requested = true;
        }
        self.unmount_signal.notify_all();
    }

    pub fn open_handles(&self) -> usize {
        self.files.len() + self.dirs.len()
    }
}

fn xattr_value(item: &MachineItem, kind: HashKind) -> Option<Vec<u8>> {
    let hex_value = item.record.hashes.get(kind)?;
    match kind {
        HashKind::Crc32 => Some(hex_value.as_bytes().to_vec()),
        _ => hex::decode(hex_value).ok(),
    }
}

impl FilesystemProvider for RomFs {
    fn stat(&self, path: &str) -> FsResult<FileAttr> {
        let node = self.resolve(path)?;
        Ok(self.attr_of(&node))
    }

    fn open(&self, path: &str, flags: i32) -> FsResult<u64> {
        if has_write_intent(flags) {
            return Err(FsError::ReadOnly);
        }
        let item = match self.resolve(path)? {
            Node::Item(item) => item,
            Node::Control => {
                let handle = self.allocate_handle();
                self.files.insert(
                    handle,
                    OpenFile {
                        size: 0,
                        reader: Mutex::new(None),
                    },
                );
                return Ok(handle);
            }
            _ => return Err(FsError::IsDirectory),
        };

        let size = item.record.size;
        let reader = match item.record.store_key() {
            Some(key) if self.store.contains(&key) => Some(self.store.get_seekable(&key, size)?),
            Some(_) => {
                debug!("{}: payload not in store", path);
                None
            }
            None => {
                debug!("{}: record has no store key", path);
                None
            }
        };

        let handle = self.allocate_handle();
        self.files.insert(
            handle,
            OpenFile {
                size,
                reader: Mutex::new(reader),
            },
        );
        trace!("open {} -> {}", path, handle);
        Ok(handle)
    }

    fn read(&self, handle: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let file = self.files.get(&handle).ok_or(FsError::BadHandle)?;
        if offset >= file.size || size == 0 {
            return Ok(Vec::new());
        }
        let mut reader = file
            .reader
            .lock()
            .map_err(|_| FsError::Io("handle poisoned".to_string()))?;
        let reader = reader
            .as_mut()
            .ok_or_else(|| FsError::Io("payload is not in the repository".to_string()))?;

        let want = (file.size - offset).min(size as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = reader.read_at(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn release(&self, handle: u64) -> FsResult<()> {
        self.files
            .remove(&handle)
            .map(|_| ())
            .ok_or(FsError::BadHandle)
    }

    fn opendir(&self, path: &str) -> FsResult<u64> {
        let node = self.resolve(path)?;
        let entries = self.list(&node)?;
        let handle = self.allocate_handle();
        self.dirs.insert(handle, entries);
        Ok(handle)
    }

    fn readdir(&self, handle: u64) -> FsResult<Vec<DirEntry>> {
        self.dirs
            .get(&handle)
            .map(|entries| entries.clone())
            .ok_or(FsError::BadHandle)
    }

    fn releasedir(&self, handle: u64) -> FsResult<()> {
        self.dirs
            .remove(&handle)
            .map(|_| ())
            .ok_or(FsError::BadHandle)
    }

    fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let Node::Item(item) = self.resolve(path)? else {
            return Err(FsError::NoAttribute);
        };
        let kind = name
            .strip_prefix(XATTR_PREFIX)
            .and_then(|algo| algo.parse::<HashKind>().ok())
            .ok_or(FsError::NoAttribute)?;
        xattr_value(&item, kind).ok_or(FsError::NoAttribute)
    }

    fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        match self.resolve(path)? {
            Node::Item(item) => Ok(item
                .record
                .hashes
                .present()
                .map(|(kind, _)| format!("{}{}", XATTR_PREFIX, kind))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn statfs(&self) -> FsResult<StatFs> {
        let (files, bytes) = lock(&self.db)?.repository_totals()?;
        Ok(StatFs {
            blocks: bytes.div_ceil(BLOCK_SIZE),
            bfree: 0,
            bavail: 0,
            files,
            ffree: 0,
            bsize: BLOCK_SIZE as u32,
            namelen: 255,
        })
    }

    fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> FsResult<()> {
        let is_control = split_path(path) == [CONTROL_FILE];
        if is_control && name == UNMOUNT_XATTR {
            return self.request_unmount(value);
        }
        Err(FsError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("/a/b/"), vec!["a", "b"]);
        assert_eq!(split_path("\\a\\b\\c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_discriminator_goes_before_extension() {
        assert_eq!(with_discriminator("x.bin", 7), "x (7).bin");
        assert_eq!(with_discriminator("hd.chd", 12), "hd (12).chd");
        assert_eq!(with_discriminator("README", 3), "README (3)");
        assert_eq!(with_discriminator(".hidden", 4), ".hidden (4)");
    }

    #[test]
    fn test_duplicate_romset_names_get_ids() {
        let now = Utc::now();
        let romset = |id: i64, name: &str| RomSet {
            id,
            name: name.to_string(),
            description: None,
            version: None,
            author: None,
            date: None,
            homepage: None,
            category: None,
            file_name: None,
            sha384: None,
            created_at: now,
            updated_at: now,
        };
        let folders: Vec<String> = romset_folders(vec![
            romset(1, "Set"),
            romset(2, "Set"),
            romset(3, "Other/Set"),
        ])
        .into_iter()
        .map(|(f, _)| f)
        .collect();
        assert_eq!(folders, vec!["Set (1)", "Set (2)", "Other_Set"]);
    }
}
