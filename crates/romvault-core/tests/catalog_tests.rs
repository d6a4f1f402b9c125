mod common;

use common::{catalog, crc_item, payload, TestRepo};
use romvault_core::catalog::{DatItem, DatSource};
use romvault_core::hasher::{fingerprint_bytes, HashKind};
use romvault_core::progress::{ChannelReporter, ProgressEvent};
use romvault_core::storage::lock;
use romvault_core::store::StoreKey;
use romvault_core::{CatalogImporter, Error, ItemKind, SilentReporter};
use std::sync::mpsc;

const SHA1_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA1_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const MD5_A: &str = "0123456789abcdef0123456789abcdef";

fn importer(repo: &TestRepo) -> CatalogImporter {
    CatalogImporter::new(repo.db.clone(), repo.store.clone())
}

#[test]
fn test_fresh_import_reports_missing_item() {
    let repo = TestRepo::new();
    let cat = catalog(
        "A",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "m1.bin", 1024).with_hash(HashKind::Crc32, "DEADBEEF")],
    );

    let summary = importer(&repo).import(&cat, None, &SilentReporter).unwrap();
    assert!(!summary.already_imported);
    assert_eq!(summary.machines, 1);
    assert_eq!(summary.items, 1);
    assert_eq!(summary.new_records, 1);

    let stat = summary.stat.unwrap();
    assert_eq!(stat.total_machines, 1);
    assert_eq!(stat.complete_machines, 0);
    assert_eq!(stat.incomplete_machines, 1);
    assert_eq!(stat.total_items, 1);
    assert_eq!(stat.have_items, 0);
    assert_eq!(stat.miss_items, 1);

    let db = lock(&repo.db).unwrap();
    let records = db
        .find_records(ItemKind::File, HashKind::Crc32, "deadbeef", 1024)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_in_repo);
    assert_eq!(db.get_romset_stat(summary.romset_id).unwrap(), Some(stat));
}

#[test]
fn test_identical_items_share_one_record() {
    let repo = TestRepo::new();
    let data = payload(1024, 1);
    let fp = fingerprint_bytes(&data);
    let item = |machine: &str, name: &str| {
        DatItem::new(machine, ItemKind::File, name, 1024)
            .with_hash(HashKind::Sha512, fp.get(HashKind::Sha512))
    };
    let cat = catalog("A", &["M1", "M2"], vec![item("M1", "a.bin"), item("M2", "b.bin")]);

    let summary = importer(&repo).import(&cat, None, &SilentReporter).unwrap();
    assert_eq!(summary.new_records, 1);

    let db = lock(&repo.db).unwrap();
    assert_eq!(db.count_records(ItemKind::File).unwrap(), 1);
    assert_eq!(db.count_associations(ItemKind::File).unwrap(), 2);
}

#[test]
fn test_conflicting_digest_creates_new_record() {
    let repo = TestRepo::new();
    let first = catalog(
        "A",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "x.bin", 1024)
            .with_hash(HashKind::Crc32, "12345678")
            .with_hash(HashKind::Sha1, SHA1_A)],
    );
    let second = catalog(
        "B",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "x.bin", 1024)
            .with_hash(HashKind::Crc32, "12345678")
            .with_hash(HashKind::Sha1, SHA1_B)],
    );

    importer(&repo).import(&first, None, &SilentReporter).unwrap();
    let summary = importer(&repo).import(&second, None, &SilentReporter).unwrap();
    assert_eq!(summary.new_records, 1);
    assert_eq!(summary.matched_records, 0);

    let db = lock(&repo.db).unwrap();
    assert_eq!(db.count_records(ItemKind::File).unwrap(), 2);
    let by_crc = db
        .find_records(ItemKind::File, HashKind::Crc32, "12345678", 1024)
        .unwrap();
    let sha1s: Vec<_> = by_crc.iter().filter_map(|r| r.hashes.sha1.clone()).collect();
    assert!(sha1s.contains(&SHA1_A.to_string()));
    assert!(sha1s.contains(&SHA1_B.to_string()));
}

#[test]
fn test_different_size_is_never_the_same_payload() {
    let repo = TestRepo::new();
    let cat = catalog(
        "A",
        &["M1"],
        vec![
            DatItem::new("M1", ItemKind::File, "a.bin", 1024).with_hash(HashKind::Crc32, "cafebabe"),
            DatItem::new("M1", ItemKind::File, "b.bin", 2048).with_hash(HashKind::Crc32, "cafebabe"),
        ],
    );
    importer(&repo).import(&cat, None, &SilentReporter).unwrap();
    assert_eq!(lock(&repo.db).unwrap().count_records(ItemKind::File).unwrap(), 2);
}

#[test]
fn test_backfill_only_fills_empty_columns() {
    let repo = TestRepo::new();
    let crc_only = catalog(
        "A",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "x.bin", 512).with_hash(HashKind::Crc32, "0badf00d")],
    );
    let with_sha1 = catalog(
        "B",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "x.bin", 512)
            .with_hash(HashKind::Crc32, "0badf00d")
            .with_hash(HashKind::Sha1, SHA1_A)],
    );
    let with_md5 = catalog(
        "C",
        &["M1"],
        vec![DatItem::new("M1", ItemKind::File, "x.bin", 512)
            .with_hash(HashKind::Crc32, "0badf00d")
            .with_hash(HashKind::Md5, MD5_A)],
    );

    importer(&repo).import(&crc_only, None, &SilentReporter).unwrap();
    let summary = importer(&repo).import(&with_sha1, None, &SilentReporter).unwrap();
    assert_eq!(summary.new_records, 0);
    assert_eq!(summary.updated_records, 1);
    importer(&repo).import(&with_md5, None, &SilentReporter).unwrap();

    let db = lock(&repo.db).unwrap();
    assert_eq!(db.count_records(ItemKind::File).unwrap(), 1);
    let record = db
        .find_records(ItemKind::File, HashKind::Crc32, "0badf00d", 512)
        .unwrap()
        .remove(0);
    assert_eq!(record.hashes.sha1.as_deref(), Some(SHA1_A));
    assert_eq!(record.hashes.md5.as_deref(), Some(MD5_A));
    assert_eq!(db.count_associations(ItemKind::File).unwrap(), 3);
}

#[test]
fn test_item_kinds_are_resolved_separately() {
    let repo = TestRepo::new();
    let cat = catalog(
        "A",
        &["M1"],
        vec![
            DatItem::new("M1", ItemKind::File, "a.bin", 64).with_hash(HashKind::Sha1, SHA1_A),
            DatItem::new("M1", ItemKind::Disk, "a", 64).with_hash(HashKind::Sha1, SHA1_A),
        ],
    );
    let summary = importer(&repo).import(&cat, None, &SilentReporter).unwrap();
    assert_eq!(summary.new_records, 2);

    let db = lock(&repo.db).unwrap();
    assert_eq!(db.count_records(ItemKind::File).unwrap(), 1);
    assert_eq!(db.count_records(ItemKind::Disk).unwrap(), 1);
    assert_eq!(db.count_associations(ItemKind::Disk).unwrap(), 1);
}

#[test]
fn test_unknown_machine_writes_nothing() {
    let repo = TestRepo::new();
    let cat = catalog(
        "A",
        &["M1"],
        vec![
            crc_item("M1", "ok.bin", b"ok"),
            crc_item("M9", "orphan.bin", b"orphan"),
        ],
    );

    let err = importer(&repo).import(&cat, None, &SilentReporter).unwrap_err();
    match err {
        Error::UnknownMachine { machine, catalog } => {
            assert_eq!(machine, "M9");
            assert_eq!(catalog, "A");
        }
        other => panic!("unexpected error: {}", other),
    }

    let db = lock(&repo.db).unwrap();
    assert!(db.list_romsets().unwrap().is_empty());
    assert_eq!(db.count_records(ItemKind::File).unwrap(), 0);
}

#[test]
fn test_same_dat_is_imported_once() {
    let repo = TestRepo::new();
    let json = br#"{
        "header": { "name": "A", "version": "1" },
        "machines": [ { "name": "M1" } ],
        "items": [ { "machine": "M1", "kind": "rom", "name": "m1.bin", "size": 1024, "crc": "DEADBEEF" } ]
    }"#;
    let path = repo.dir.path().join("a.json");
    std::fs::write(&path, json).unwrap();

    let first = importer(&repo).import_file(&path, &SilentReporter).unwrap();
    let second = importer(&repo).import_file(&path, &SilentReporter).unwrap();
    assert!(!first.already_imported);
    assert!(second.already_imported);
    assert_eq!(second.romset_id, first.romset_id);

    let key = StoreKey::for_datfile(&fingerprint_bytes(json));
    assert!(repo.store.contains(&key));

    let db = lock(&repo.db).unwrap();
    let romsets = db.list_romsets().unwrap();
    assert_eq!(romsets.len(), 1);
    assert_eq!(romsets[0].file_name.as_deref(), Some("a.json"));
    assert_eq!(db.count_associations(ItemKind::File).unwrap(), 1);
}

#[test]
fn test_remove_romset_drops_stored_dat() {
    let repo = TestRepo::new();
    let bytes = b"{\"header\":{\"name\":\"A\"},\"machines\":[{\"name\":\"M1\"}],\"items\":[]}";
    let cat = romvault_core::catalog::DatCatalog::from_json_slice(bytes).unwrap();
    let source = DatSource {
        file_name: Some("a.json".to_string()),
        bytes,
    };
    let imp = importer(&repo);
    let summary = imp.import(&cat, Some(source), &SilentReporter).unwrap();
    let key = StoreKey::for_datfile(&fingerprint_bytes(bytes));
    assert!(repo.store.contains(&key));

    assert!(imp.remove_romset(summary.romset_id).unwrap());
    assert!(!repo.store.contains(&key));
    assert!(!imp.remove_romset(summary.romset_id).unwrap());
    assert!(lock(&repo.db).unwrap().list_romsets().unwrap().is_empty());
}

#[test]
fn test_import_reports_progress() {
    let repo = TestRepo::new();
    let items = (0..5)
        .map(|i| crc_item("M1", &format!("{}.bin", i), &payload(16, i)))
        .collect();
    let cat = catalog("A", &["M1"], items);

    let (tx, rx) = mpsc::channel();
    let reporter = ChannelReporter::new(tx);
    importer(&repo).import(&cat, None, &reporter).unwrap();
    drop(reporter);

    let events: Vec<ProgressEvent> = rx.iter().collect();
    assert!(events.contains(&ProgressEvent::Bounds { min: 0, max: 5 }));
    assert!(events.contains(&ProgressEvent::Progress(5)));
    assert!(matches!(events.last(), Some(ProgressEvent::Finished(_))));
}

#[test]
fn test_completeness_counts_machines_with_items() {
    let repo = TestRepo::new();
    let item = |machine: &str, crc: &str| {
        DatItem::new(machine, ItemKind::File, &format!("{}.bin", crc), 100).with_hash(HashKind::Crc32, crc)
    };
    let cat = catalog(
        "A",
        &["M1", "M2", "EMPTY"],
        vec![
            item("M1", "00000001"),
            item("M1", "00000002"),
            item("M1", "00000003"),
            item("M2", "00000004"),
        ],
    );
    let summary = importer(&repo).import(&cat, None, &SilentReporter).unwrap();

    let db = lock(&repo.db).unwrap();
    for crc in ["00000001", "00000002", "00000004"] {
        let record = db
            .find_records(ItemKind::File, HashKind::Crc32, crc, 100)
            .unwrap()
            .remove(0);
        db.set_in_repo(ItemKind::File, record.id, true).unwrap();
    }

    let stat = db.refresh_romset_stat(summary.romset_id).unwrap();
    assert_eq!(stat.total_machines, 3);
    assert_eq!(stat.complete_machines, 1);
    assert_eq!(stat.incomplete_machines, 1);
    assert_eq!(stat.total_items, 4);
    assert_eq!(stat.have_items, 3);
    assert_eq!(stat.miss_items, 1);
}

/// Three descriptions of one payload: CRC only, SHA1 only, both.
fn split_descriptions(data: &[u8]) -> [DatItem; 3] {
    let fp = fingerprint_bytes(data);
    let size = data.len() as u64;
    [
        DatItem::new("M1", ItemKind::File, "crc.bin", size)
            .with_hash(HashKind::Crc32, fp.get(HashKind::Crc32)),
        DatItem::new("M1", ItemKind::File, "sha.bin", size)
            .with_hash(HashKind::Sha1, fp.get(HashKind::Sha1)),
        DatItem::new("M1", ItemKind::File, "both.bin", size)
            .with_hash(HashKind::Crc32, fp.get(HashKind::Crc32))
            .with_hash(HashKind::Sha1, fp.get(HashKind::Sha1)),
    ]
}

#[test]
fn test_record_set_does_not_depend_on_item_order() {
    let data = payload(512, 9);
    let [crc, sha, both] = split_descriptions(&data);
    let orders = [
        vec![both.clone(), crc.clone(), sha.clone()],
        vec![crc.clone(), sha.clone(), both.clone()],
        vec![sha, both, crc],
    ];

    for items in orders {
        let repo = TestRepo::new();
        let summary = importer(&repo)
            .import(&catalog("A", &["M1"], items), None, &SilentReporter)
            .unwrap();
        assert_eq!(summary.new_records, 1);
        assert_eq!(summary.matched_records, 2);

        let db = lock(&repo.db).unwrap();
        assert_eq!(db.count_records(ItemKind::File).unwrap(), 1);
        assert_eq!(db.count_associations(ItemKind::File).unwrap(), 3);
        let fp = fingerprint_bytes(&data);
        let record = db
            .find_records(ItemKind::File, HashKind::Crc32, fp.get(HashKind::Crc32), 512)
            .unwrap()
            .remove(0);
        assert_eq!(record.hashes.sha1.as_deref(), Some(fp.get(HashKind::Sha1)));
    }
}
