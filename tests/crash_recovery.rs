//! Crash recovery: a database directory snapshotted after WAL sync but
//! before any checkpoint must replay to the full committed state. The
//! "crash" is simulated by copying the live directory (per-record WAL sync
//! makes every acknowledged write durable) and opening the copy.

use std::path::Path;

use burrowdb::{Db, Options};
use tempfile::tempdir;

fn crash_opts() -> Options {
    Options {
        page_size: 4096,
        wal_sync: 0, // every acknowledged write is fsynced
        check_point_interval: 3_600, // keep the checkpointer out of the test
        ..Options::default()
    }
}

fn snapshot_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[test]
fn all_synced_writes_survive_a_crash_before_checkpoint() {
    let dir = tempdir().unwrap();
    let live = dir.path().join("db");
    let crashed = dir.path().join("crashed");

    let db = Db::open(&live, crash_opts()).unwrap();
    for i in 0..1_000 {
        let key = format!("k{i:05}");
        db.put(key.as_bytes(), format!("v{i}").as_bytes()).unwrap();
    }
    // Snapshot the directory while the process is still "running": the
    // data file has only the initial flush, everything else is WAL.
    snapshot_dir(&live, &crashed);

    let recovered = Db::open(&crashed, crash_opts()).unwrap();
    assert_eq!(recovered.key_count(), 1_000);
    for i in 0..1_000 {
        let key = format!("k{i:05}");
        assert_eq!(
            recovered.get(key.as_bytes()).unwrap(),
            Some(format!("v{i}").into_bytes()),
            "key {i} lost in recovery"
        );
    }

    // The recovered state is iterable in order.
    let mut it = recovered.iter();
    it.seek_first().unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    while it.valid() {
        let key = it.key().unwrap().unwrap().to_vec();
        if let Some(prev) = &last {
            assert!(prev < &key);
        }
        last = Some(key);
        count += 1;
        it.next().unwrap();
    }
    assert_eq!(count, 1_000);
}

#[test]
fn uncommitted_transaction_is_invisible_after_crash() {
    let dir = tempdir().unwrap();
    let live = dir.path().join("db");
    let crashed = dir.path().join("crashed");

    let db = Db::open(&live, crash_opts()).unwrap();
    db.put(b"base", b"committed").unwrap();

    let mut tx = db.begin().unwrap();
    tx.put(b"pending", b"never committed").unwrap();
    // Force the transaction's WAL records to disk without committing.
    db.flush_wal().unwrap();
    snapshot_dir(&live, &crashed);
    drop(tx);

    let recovered = Db::open(&crashed, crash_opts()).unwrap();
    assert_eq!(recovered.get(b"base").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(
        recovered.get(b"pending").unwrap(),
        None,
        "uncommitted write resurrected by recovery"
    );
}

#[test]
fn crash_after_commit_preserves_the_transaction() {
    let dir = tempdir().unwrap();
    let live = dir.path().join("db");
    let crashed = dir.path().join("crashed");

    let db = Db::open(&live, crash_opts()).unwrap();
    let mut tx = db.begin().unwrap();
    for i in 0..50 {
        tx.put(format!("t{i:03}").as_bytes(), b"durable").unwrap();
    }
    tx.commit().unwrap();
    snapshot_dir(&live, &crashed);

    let recovered = Db::open(&crashed, crash_opts()).unwrap();
    assert_eq!(recovered.key_count(), 50);
    assert_eq!(recovered.get(b"t007").unwrap(), Some(b"durable".to_vec()));
}

#[test]
fn recovery_is_idempotent_across_double_crash() {
    let dir = tempdir().unwrap();
    let live = dir.path().join("db");
    let first = dir.path().join("first");
    let second = dir.path().join("second");

    let db = Db::open(&live, crash_opts()).unwrap();
    for i in 0..200 {
        db.put(format!("k{i:04}").as_bytes(), b"v").unwrap();
    }
    for i in 0..100 {
        db.delete(format!("k{i:04}").as_bytes()).unwrap();
    }
    snapshot_dir(&live, &first);

    // Recover once, then "crash" again immediately and recover the result.
    {
        let recovered = Db::open(&first, crash_opts()).unwrap();
        assert_eq!(recovered.key_count(), 100);
    }
    snapshot_dir(&first, &second);
    let recovered = Db::open(&second, crash_opts()).unwrap();
    assert_eq!(recovered.key_count(), 100);
    assert_eq!(recovered.get(b"k0000").unwrap(), None);
    assert_eq!(recovered.get(b"k0150").unwrap(), Some(b"v".to_vec()));
}
