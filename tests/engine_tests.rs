//! Summary: End-to-end engine tests: durability across reopen, tree
//! growth and shrinkage at scale, and free-list recycling.
//! Copyright (c) YOAB. All rights reserved.

use ember::{Database, Error, KvIter, Options, Scan, SeekCmp};
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::StdRng};
use tempfile::TempDir;

fn new_dir() -> TempDir {
    tempfile::tempdir().expect("tempdir should be creatable")
}

fn open_small(dir: &TempDir) -> Database {
    // A small first chunk keeps the sparse test files tiny.
    Options::new()
        .initial_map_size(1 << 20)
        .open(dir.path().join("test.db"))
        .expect("open should succeed")
}

/// Collects every `(key, value)` pair visible in a fresh read transaction.
fn dump(db: &Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let rtx = db.begin_read();
    let mut iter = rtx.seek(b"", SeekCmp::Ge);
    let mut out = Vec::new();
    while iter.valid() {
        let (k, v) = iter.deref().unwrap();
        out.push((k.to_vec(), v.to_vec()));
        iter.next();
    }
    out
}

// ==================== Open / Reopen ====================

#[test]
fn test_empty_open_set_commit_reopen() {
    let dir = new_dir();
    {
        let db = open_small(&dir);
        let mut tx = db.begin_write().expect("begin_write should succeed");
        tx.set(b"a", b"1").expect("set should succeed");
        tx.commit().expect("commit should succeed");
        db.close();
    }

    let db = open_small(&dir);
    let rtx = db.begin_read();
    assert_eq!(rtx.get(b"a"), Some(b"1".to_vec()));
}

#[test]
fn test_reopen_without_any_commit() {
    let dir = new_dir();
    {
        let db = open_small(&dir);
        db.close();
    }
    let db = open_small(&dir);
    assert_eq!(db.begin_read().get(b"anything"), None);
}

#[test]
fn test_reopen_preserves_full_key_set() {
    let dir = new_dir();
    let before;
    {
        let db = open_small(&dir);
        for round in 0..5 {
            let mut tx = db.begin_write().expect("begin_write");
            for i in 0..40 {
                let key = format!("r{round}k{i:03}");
                let val = format!("v{round}.{i}");
                tx.set(key.as_bytes(), val.as_bytes()).expect("set");
            }
            // every other round also deletes a few keys from earlier rounds
            if round % 2 == 1 {
                for i in 0..10 {
                    let key = format!("r{}k{i:03}", round - 1);
                    tx.del(key.as_bytes()).expect("del");
                }
            }
            tx.commit().expect("commit");
        }
        before = dump(&db);
        db.close();
    }

    let db = open_small(&dir);
    assert_eq!(dump(&db), before, "reopen must yield the same contents");
}

#[test]
fn test_second_open_is_locked_out() {
    let dir = new_dir();
    let db = open_small(&dir);
    let second = Database::open(db.path());
    assert!(
        matches!(second, Err(Error::FileLock { .. })),
        "a second open of a live database must fail"
    );
}

#[test]
fn test_open_rejects_garbage_file() {
    let dir = new_dir();
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0x5a; 8192]).expect("write garbage");
    match Database::open(&path) {
        Err(Error::Corrupted { .. }) => {}
        other => panic!("expected Corrupted, got {other:?}", other = other.err()),
    }
}

// ==================== Sentinel / Empty Key ====================

#[test]
fn test_empty_key_semantics() {
    let dir = new_dir();
    let db = open_small(&dir);

    // The sentinel is an internal fence, not a user key.
    assert_eq!(db.begin_read().get(b""), None);

    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"", b"x").expect("set empty key");
    tx.commit().expect("commit");
    assert_eq!(db.begin_read().get(b""), Some(b"x".to_vec()));

    // Still not confused with ordinary keys.
    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"a", b"1").expect("set");
    tx.commit().expect("commit");
    assert_eq!(db.begin_read().get(b""), Some(b"x".to_vec()));

    let mut tx = db.begin_write().expect("begin_write");
    assert!(tx.del(b"").expect("del"));
    tx.commit().expect("commit");
    assert_eq!(db.begin_read().get(b""), None);
    assert_eq!(db.begin_read().get(b"a"), Some(b"1".to_vec()));
}

#[test]
fn test_empty_key_survives_reopen() {
    let dir = new_dir();
    {
        let db = open_small(&dir);
        let mut tx = db.begin_write().expect("begin_write");
        tx.set(b"", b"fence-value").expect("set");
        tx.commit().expect("commit");
        db.close();
    }
    let db = open_small(&dir);
    assert_eq!(db.begin_read().get(b""), Some(b"fence-value".to_vec()));
}

// ==================== Split / Merge at Scale ====================

#[test]
fn test_bulk_insert_then_bulk_delete() {
    let mut rng = StdRng::seed_from_u64(42);
    let dir = new_dir();
    let db = open_small(&dir);

    let mut keys: Vec<u32> = (0..10_000).collect();
    keys.shuffle(&mut rng);

    // One transaction inserting 10,000 distinct 50-byte keys in random
    // order.
    let mut tx = db.begin_write().expect("begin_write");
    for &i in &keys {
        let key = format!("{i:050}");
        let val = format!("value{i}");
        tx.set(key.as_bytes(), val.as_bytes()).expect("set");
    }
    tx.commit().expect("commit");

    // All readable, in order, via a full forward scan.
    let all = dump(&db);
    assert_eq!(all.len(), 10_000);
    for window in all.windows(2) {
        assert!(window[0].0 < window[1].0, "scan must be strictly ordered");
    }
    for &i in keys.iter().take(100) {
        let rtx = db.begin_read();
        assert_eq!(
            rtx.get(format!("{i:050}").as_bytes()),
            Some(format!("value{i}").into_bytes())
        );
    }

    // Delete 9,000 of them, again in one transaction in random order.
    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(9_000);
    let mut tx = db.begin_write().expect("begin_write");
    for &i in gone {
        assert!(
            tx.del(format!("{i:050}").as_bytes()).expect("del"),
            "key {i} must exist before deletion"
        );
    }
    tx.commit().expect("commit");

    let remaining = dump(&db);
    assert_eq!(remaining.len(), 1_000);
    for window in remaining.windows(2) {
        assert!(window[0].0 < window[1].0);
    }
    let rtx = db.begin_read();
    for &i in gone.iter().take(200) {
        assert_eq!(rtx.get(format!("{i:050}").as_bytes()), None);
    }
    for &i in kept {
        assert!(rtx.get(format!("{i:050}").as_bytes()).is_some());
    }
}

// ==================== Read-Your-Writes ====================

#[test]
fn test_read_your_writes_within_tx() {
    let dir = new_dir();
    let db = open_small(&dir);

    let mut setup = db.begin_write().expect("begin_write");
    setup.set(b"committed", b"old").expect("set");
    setup.commit().expect("commit");

    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"committed", b"new").expect("set");
    tx.set(b"fresh", b"1").expect("set");
    assert_eq!(tx.get(b"committed"), Some(b"new".to_vec()));
    assert_eq!(tx.get(b"fresh"), Some(b"1".to_vec()));

    assert!(tx.del(b"committed").expect("del"));
    assert_eq!(tx.get(b"committed"), None);

    tx.set(b"committed", b"newer").expect("set");
    assert_eq!(tx.get(b"committed"), Some(b"newer".to_vec()));
    tx.commit().expect("commit");

    let rtx = db.begin_read();
    assert_eq!(rtx.get(b"committed"), Some(b"newer".to_vec()));
    assert_eq!(rtx.get(b"fresh"), Some(b"1".to_vec()));
}

#[test]
fn test_tx_scan_merges_pending_and_snapshot() {
    let dir = new_dir();
    let db = open_small(&dir);

    let mut setup = db.begin_write().expect("begin_write");
    for k in [b"b", b"d", b"f"] {
        setup.set(k, b"disk").expect("set");
    }
    setup.commit().expect("commit");

    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"c", b"mem").expect("set"); // between disk keys
    tx.set(b"d", b"mem").expect("set"); // shadows a disk key
    tx.del(b"f").expect("del"); // hides a disk key

    let mut iter = tx.scan(&Scan::range(&b"a"[..], &b"z"[..]));
    let mut seen = Vec::new();
    while iter.valid() {
        let (k, v) = iter.deref().unwrap();
        seen.push((k.to_vec(), v.to_vec()));
        iter.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"b".to_vec(), b"disk".to_vec()),
            (b"c".to_vec(), b"mem".to_vec()),
            (b"d".to_vec(), b"mem".to_vec()),
        ]
    );
}

#[test]
fn test_tx_iter_reverses_direction() {
    let dir = new_dir();
    let db = open_small(&dir);

    let mut setup = db.begin_write().expect("begin_write");
    for k in [&b"a"[..], &b"c"[..], &b"e"[..]] {
        setup.set(k, b"v").expect("set");
    }
    setup.commit().expect("commit");

    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"b", b"v").expect("set");

    let mut iter = tx.seek(b"a", SeekCmp::Ge);
    assert_eq!(iter.deref().unwrap().0, b"a");
    iter.next();
    assert_eq!(iter.deref().unwrap().0, b"b");
    iter.next();
    assert_eq!(iter.deref().unwrap().0, b"c");
    iter.prev();
    assert_eq!(iter.deref().unwrap().0, b"b");
    iter.prev();
    assert_eq!(iter.deref().unwrap().0, b"a");
}

// ==================== Input Limits ====================

#[test]
fn test_oversized_inputs_rejected() {
    let dir = new_dir();
    let db = open_small(&dir);
    let mut tx = db.begin_write().expect("begin_write");

    let big_key = vec![b'k'; ember::MAX_KEY_SIZE + 1];
    assert!(matches!(
        tx.set(&big_key, b"v"),
        Err(Error::InputTooLarge { what: "key", .. })
    ));

    let big_val = vec![b'v'; ember::MAX_VAL_SIZE + 1];
    assert!(matches!(
        tx.set(b"k", &big_val),
        Err(Error::InputTooLarge { what: "value", .. })
    ));

    // Boundary sizes are fine.
    let max_key = vec![b'k'; ember::MAX_KEY_SIZE];
    let max_val = vec![b'v'; ember::MAX_VAL_SIZE];
    tx.set(&max_key, &max_val).expect("max-size pair should fit");
    tx.commit().expect("commit");

    let rtx = db.begin_read();
    assert_eq!(rtx.get(&max_key), Some(max_val));
}

// ==================== Free-List Recycling ====================

#[test]
fn test_allocations_recycle_freed_pages() {
    let dir = new_dir();
    let db = open_small(&dir);

    // Build and tear down a sizeable tree to populate the free list.
    let mut tx = db.begin_write().expect("begin_write");
    for i in 0..2000u32 {
        tx.set(format!("key{i:06}").as_bytes(), b"some value")
            .expect("set");
    }
    tx.commit().expect("commit");

    let mut tx = db.begin_write().expect("begin_write");
    for i in 0..1900u32 {
        tx.del(format!("key{i:06}").as_bytes()).expect("del");
    }
    tx.commit().expect("commit");

    let before = db.stats();
    assert!(before.free_items > 50, "teardown must have freed pages");

    // A small follow-up transaction should be served from the free list
    // without growing the file.
    let mut tx = db.begin_write().expect("begin_write");
    for i in 0..50u32 {
        tx.set(format!("new{i:04}").as_bytes(), b"recycled").expect("set");
    }
    tx.commit().expect("commit");

    let after = db.stats();
    assert!(
        after.alloc.reused > before.alloc.reused,
        "allocations must come from the free list first"
    );
    assert_eq!(
        after.alloc.appended, before.alloc.appended,
        "no file growth while the free list can serve allocations"
    );
    assert_eq!(after.flushed_pages, before.flushed_pages);
}

#[test]
fn test_overwrite_does_not_leak_pages() {
    let dir = new_dir();
    let db = open_small(&dir);

    let mut tx = db.begin_write().expect("begin_write");
    tx.set(b"k", b"v1").expect("set");
    tx.commit().expect("commit");

    // Repeated overwrites must reach a steady state where pages recycle
    // instead of accumulating.
    for round in 0..20 {
        let mut tx = db.begin_write().expect("begin_write");
        tx.set(b"k", format!("v{round}").as_bytes()).expect("set");
        tx.commit().expect("commit");
    }
    let stats = db.stats();
    assert!(
        stats.flushed_pages < 40,
        "steady-state overwrites must not grow the file unboundedly \
         (got {} pages)",
        stats.flushed_pages
    );
    assert_eq!(db.begin_read().get(b"k"), Some(b"v19".to_vec()));
}

// ==================== Stats ====================

#[test]
fn test_version_counts_commits() {
    let dir = new_dir();
    let db = open_small(&dir);
    assert_eq!(db.stats().version, 0);
    for i in 0..3 {
        let mut tx = db.begin_write().expect("begin_write");
        tx.set(format!("k{i}").as_bytes(), b"v").expect("set");
        tx.commit().expect("commit");
    }
    assert_eq!(db.stats().version, 3);
}
