mod common;

use common::{catalog, crc_item, payload, TestRepo};
use romvault_core::catalog::DatItem;
use romvault_core::hasher::{fingerprint_bytes, HashKind};
use romvault_core::vfs::{FilesystemProvider, FsError, NodeKind, RomFs, CONTROL_FILE, UNMOUNT_XATTR};
use romvault_core::{CatalogImporter, Ingestor, ItemKind, SilentReporter};
use std::fs;
use std::time::Duration;

/// Catalog "A" with machine "M1" holding one ingested 1024-byte item and
/// one item that was never found.
fn populated() -> (TestRepo, RomFs, Vec<u8>) {
    let repo = TestRepo::new();
    let data = payload(1024, 77);
    let cat = catalog(
        "A",
        &["M1"],
        vec![
            crc_item("M1", "m1.bin", &data),
            DatItem::new("M1", ItemKind::File, "missing.bin", 10).with_hash(HashKind::Crc32, "feedface"),
            DatItem::new("M1", ItemKind::Disk, "hd", 10).with_hash(HashKind::Sha1, "cccccccccccccccccccccccccccccccccccccccc"),
        ],
    );
    CatalogImporter::new(repo.db.clone(), repo.store.clone())
        .import(&cat, None, &SilentReporter)
        .unwrap();

    let dir = repo.source_dir();
    fs::write(dir.join("m1.bin"), &data).unwrap();
    Ingestor::new(repo.config.clone(), repo.db.clone(), repo.store.clone())
        .unwrap()
        .ingest(&[dir], &SilentReporter)
        .unwrap();

    let fs = RomFs::new(repo.db.clone(), repo.store.clone());
    (repo, fs, data)
}

fn list(fs: &RomFs, path: &str) -> Vec<(String, NodeKind)> {
    let handle = fs.opendir(path).unwrap();
    let entries = fs.readdir(handle).unwrap();
    fs.releasedir(handle).unwrap();
    entries.into_iter().map(|e| (e.name, e.kind)).collect()
}

#[test]
fn test_hierarchy_listing() {
    let (_repo, fs, _) = populated();
    assert_eq!(list(&fs, "/"), vec![("A".to_string(), NodeKind::Directory)]);
    assert_eq!(list(&fs, "/A"), vec![("M1".to_string(), NodeKind::Directory)]);
    assert_eq!(
        list(&fs, "/A/M1"),
        vec![
            ("m1.bin".to_string(), NodeKind::RegularFile),
            ("missing.bin".to_string(), NodeKind::RegularFile),
            ("hd.chd".to_string(), NodeKind::RegularFile),
        ]
    );
}

#[test]
fn test_stat() {
    let (_repo, fs, _) = populated();
    let root = fs.stat("/").unwrap();
    assert!(root.is_dir());
    assert_eq!(root.perm, 0o555);

    let attr = fs.stat("/A/M1/m1.bin").unwrap();
    assert!(!attr.is_dir());
    assert_eq!(attr.size, 1024);
    assert_eq!(attr.blocks, 2);
    assert_eq!(attr.perm, 0o444);

    assert_eq!(fs.stat("/A/M2"), Err(FsError::NotFound));
    assert_eq!(fs.stat("/B"), Err(FsError::NotFound));
    assert_eq!(fs.stat("/A/M1/nope.bin"), Err(FsError::NotFound));

    // nothing lives below an item
    let deep = "/A/M1/m1.bin/x";
    let err = fs.stat(deep).unwrap_err();
    assert_eq!(err, FsError::NotSupported);
    assert_eq!(err.errno(), libc::ENOTSUP);
    assert_eq!(fs.open(deep, libc::O_RDONLY), Err(FsError::NotSupported));
    assert_eq!(
        fs.getxattr(deep, "user.romvault.crc32"),
        Err(FsError::NotSupported)
    );
}

#[test]
fn test_read_serves_payload() {
    let (_repo, fs, data) = populated();
    let handle = fs.open("/A/M1/m1.bin", libc::O_RDONLY).unwrap();

    assert_eq!(fs.read(handle, 0, 4096).unwrap(), data);
    assert_eq!(fs.read(handle, 1000, 100).unwrap(), &data[1000..]);
    assert_eq!(fs.read(handle, 100, 10).unwrap(), &data[100..110]);
    assert!(fs.read(handle, 1024, 10).unwrap().is_empty());

    fs.release(handle).unwrap();
    assert_eq!(fs.read(handle, 0, 10), Err(FsError::BadHandle));
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn test_read_of_absent_payload_fails_with_eio() {
    let (_repo, fs, _) = populated();
    let handle = fs.open("/A/M1/missing.bin", libc::O_RDONLY).unwrap();
    let err = fs.read(handle, 0, 10).unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    fs.release(handle).unwrap();
}

#[test]
fn test_open_rejects_directories_and_write_flags() {
    let (_repo, fs, _) = populated();
    assert_eq!(fs.open("/A/M1", libc::O_RDONLY), Err(FsError::IsDirectory));
    assert_eq!(fs.open("/A/M1/m1.bin", libc::O_WRONLY), Err(FsError::ReadOnly));
    assert_eq!(fs.open("/A/M1/m1.bin", libc::O_RDWR), Err(FsError::ReadOnly));
    assert_eq!(
        fs.open("/A/M1/m1.bin", libc::O_RDONLY | libc::O_TRUNC),
        Err(FsError::ReadOnly)
    );
    assert_eq!(fs.opendir("/A/M1/m1.bin"), Err(FsError::NotDirectory));
}

#[test]
fn test_every_mutation_is_read_only() {
    let (_repo, fs, _) = populated();
    let file = "/A/M1/m1.bin";
    let handle = fs.open(file, libc::O_RDONLY).unwrap();

    assert_eq!(fs.create("/A/M1/new.bin", 0o644), Err(FsError::ReadOnly));
    assert_eq!(fs.write(handle, 0, b"x"), Err(FsError::ReadOnly));
    assert_eq!(fs.truncate(file, 0), Err(FsError::ReadOnly));
    assert_eq!(fs.rename(file, "/A/M1/moved.bin"), Err(FsError::ReadOnly));
    assert_eq!(fs.chmod(file, 0o777), Err(FsError::ReadOnly));
    assert_eq!(fs.chown(file, Some(0), None), Err(FsError::ReadOnly));
    assert_eq!(fs.set_times(file, None, None), Err(FsError::ReadOnly));
    assert_eq!(fs.unlink(file), Err(FsError::ReadOnly));
    assert_eq!(fs.mkdir("/A/M1/sub", 0o755), Err(FsError::ReadOnly));
    assert_eq!(fs.rmdir("/A/M1"), Err(FsError::ReadOnly));
    assert_eq!(fs.setxattr(file, "user.romvault.crc32", b"00000000"), Err(FsError::ReadOnly));
    assert_eq!(fs.removexattr(file, "user.romvault.crc32"), Err(FsError::ReadOnly));
    for err in [
        fs.create("/x", 0).unwrap_err(),
        fs.unlink("/x").unwrap_err(),
    ] {
        assert_eq!(err.errno(), libc::EROFS);
    }

    // content is unchanged
    assert_eq!(fs.stat(file).unwrap().size, 1024);
    fs.release(handle).unwrap();
}

#[test]
fn test_digest_attributes() {
    let (_repo, fs, data) = populated();
    let fp = fingerprint_bytes(&data);
    let file = "/A/M1/m1.bin";

    let names = fs.listxattr(file).unwrap();
    assert_eq!(names.len(), 6);
    assert!(names.contains(&"user.romvault.sha1".to_string()));

    let crc = fs.getxattr(file, "user.romvault.crc32").unwrap();
    assert_eq!(crc, fp.get(HashKind::Crc32).as_bytes());
    let sha1 = fs.getxattr(file, "user.romvault.sha1").unwrap();
    assert_eq!(sha1.len(), 20);
    assert_eq!(hex_string(&sha1), fp.get(HashKind::Sha1));

    assert_eq!(fs.getxattr(file, "user.other"), Err(FsError::NoAttribute));
    assert_eq!(
        fs.getxattr("/A/M1/missing.bin", "user.romvault.sha1"),
        Err(FsError::NoAttribute)
    );
    assert!(fs.listxattr("/A").unwrap().is_empty());
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[test]
fn test_statfs_counts_stored_payloads() {
    let (_repo, fs, _) = populated();
    let stat = fs.statfs().unwrap();
    assert_eq!(stat.files, 1);
    assert_eq!(stat.blocks, 2);
    assert_eq!(stat.bfree, 0);
}

#[test]
fn test_unmount_token_is_single_use() {
    let (_repo, fs, _) = populated();
    let control = format!("/{}", CONTROL_FILE);
    assert!(!list(&fs, "/").iter().any(|(name, _)| name == CONTROL_FILE));
    assert!(fs.stat(&control).is_ok());

    let token = fs.issue_unmount_token();
    assert_eq!(token.len(), 32);
    assert_eq!(
        fs.setxattr(&control, UNMOUNT_XATTR, b"not-the-token"),
        Err(FsError::PermissionDenied)
    );
    assert!(!fs.unmount_requested());
    assert!(!fs.wait_for_unmount(Some(Duration::from_millis(10))));

    fs.setxattr(&control, UNMOUNT_XATTR, token.as_bytes()).unwrap();
    assert!(fs.unmount_requested());
    assert!(fs.wait_for_unmount(Some(Duration::from_millis(10))));

    assert_eq!(
        fs.setxattr(&control, UNMOUNT_XATTR, token.as_bytes()),
        Err(FsError::PermissionDenied)
    );
}

#[test]
fn test_duplicate_romset_names_get_distinct_folders() {
    let repo = TestRepo::new();
    let importer = CatalogImporter::new(repo.db.clone(), repo.store.clone());
    let first = importer
        .import(&catalog("Same", &["M1"], vec![]), None, &SilentReporter)
        .unwrap();
    let second = importer
        .import(&catalog("Same", &["M2"], vec![]), None, &SilentReporter)
        .unwrap();

    let fs = RomFs::new(repo.db.clone(), repo.store.clone());
    let names: Vec<String> = list(&fs, "/").into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        vec![
            format!("Same ({})", first.romset_id),
            format!("Same ({})", second.romset_id)
        ]
    );
    assert_eq!(
        list(&fs, &format!("/Same ({})", second.romset_id)),
        vec![("M2".to_string(), NodeKind::Directory)]
    );
}

#[test]
fn test_same_item_name_in_one_machine_stays_reachable() {
    let repo = TestRepo::new();
    let short = payload(10, 1);
    let long = payload(20, 2);
    let cat = catalog(
        "A",
        &["M1"],
        vec![crc_item("M1", "a/x.bin", &short), crc_item("M1", "b/x.bin", &long)],
    );
    CatalogImporter::new(repo.db.clone(), repo.store.clone())
        .import(&cat, None, &SilentReporter)
        .unwrap();

    let fs = RomFs::new(repo.db.clone(), repo.store.clone());
    let names: Vec<String> = list(&fs, "/A/M1").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.len(), 2);
    assert_eq!(names[0], "x.bin");
    assert_ne!(names[1], "x.bin");
    assert!(names[1].starts_with("x (") && names[1].ends_with(").bin"));

    let mut sizes: Vec<u64> = names
        .iter()
        .map(|n| fs.stat(&format!("/A/M1/{}", n)).unwrap().size)
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![10, 20]);
}
