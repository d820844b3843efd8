//! Basic single-threaded operations: round trips, boundaries, and the
//! small end-to-end open/insert/iterate scenario.

use burrowdb::{Db, DbError, Options};
use tempfile::tempdir;

fn small_pages() -> Options {
    Options {
        page_size: 4096,
        ..Options::default()
    }
}

#[test]
fn insert_three_keys_iterate_and_lookup() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();
    db.put(b"c", b"3").unwrap();

    let mut it = db.iter();
    it.seek_first().unwrap();
    let mut pairs = Vec::new();
    while it.valid() {
        let key = it.key().unwrap().unwrap().to_vec();
        let value = it.value().unwrap().unwrap();
        pairs.push((key, value));
        it.next().unwrap();
    }
    assert_eq!(
        pairs,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
    drop(it);

    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"z").unwrap(), None);
}

#[test]
fn overwrite_then_delete() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    db.put(b"k", b"v1").unwrap();
    db.put(b"k", b"v2").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));

    db.delete(b"k").unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);

    // Deleting again is a no-op and leaves the count alone.
    db.delete(b"k").unwrap();
    assert_eq!(db.key_count(), 0);
}

#[test]
fn key_length_boundaries() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    db.put(&[0x01], b"one byte").unwrap();
    db.put(&vec![b'x'; 255], b"max len").unwrap();
    assert_eq!(db.get(&[0x01]).unwrap(), Some(b"one byte".to_vec()));
    assert_eq!(db.get(&vec![b'x'; 255]).unwrap(), Some(b"max len".to_vec()));

    let err = db.put(b"", b"v").unwrap_err();
    assert!(matches!(
        burrowdb::error::error_kind(&err),
        Some(DbError::LimitExceeded(_))
    ));
    let err = db.put(&vec![b'x'; 256], b"v").unwrap_err();
    assert!(matches!(
        burrowdb::error::error_kind(&err),
        Some(DbError::LimitExceeded(_))
    ));
}

#[test]
fn value_length_boundaries() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();
    let threshold = 4096 / 16;

    for (name, len) in [
        ("empty", 0usize),
        ("at-threshold", threshold),
        ("over-threshold", threshold + 1),
        ("one-page", 4096),
        ("two-pages", 4096 * 2),
        ("three-pages", 4096 * 3),
    ] {
        let value: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        db.put(name.as_bytes(), &value).unwrap();
        assert_eq!(
            db.get(name.as_bytes()).unwrap().as_deref(),
            Some(value.as_slice()),
            "round trip failed for {name}"
        );
    }
}

#[test]
fn many_keys_stay_sorted_and_counted() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    // Insert in a shuffled-ish order to exercise mid splits.
    for i in (0..500).step_by(7).chain((0..500).filter(|i| i % 7 != 0)) {
        let key = format!("key{i:05}");
        db.put(key.as_bytes(), format!("v{i}").as_bytes()).unwrap();
    }
    assert_eq!(db.key_count(), 500);

    let mut it = db.iter();
    it.seek_first().unwrap();
    let mut last: Option<Vec<u8>> = None;
    let mut count = 0;
    while it.valid() {
        let key = it.key().unwrap().unwrap().to_vec();
        if let Some(prev) = &last {
            assert!(prev < &key, "iteration order violated");
        }
        last = Some(key);
        count += 1;
        it.next().unwrap();
    }
    assert_eq!(count, 500);
}

#[test]
fn deleting_everything_empties_the_tree() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    for i in 0..300 {
        let key = format!("key{i:05}");
        db.put(key.as_bytes(), b"value").unwrap();
    }
    for i in 0..300 {
        let key = format!("key{i:05}");
        db.delete(key.as_bytes()).unwrap();
    }
    assert_eq!(db.key_count(), 0);
    for i in 0..300 {
        let key = format!("key{i:05}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), None);
    }
    let mut it = db.iter();
    it.seek_first().unwrap();
    assert!(!it.valid());
}

#[test]
fn interleaved_inserts_and_deletes() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), small_pages()).unwrap();

    for i in 0..400 {
        let key = format!("key{i:05}");
        db.put(key.as_bytes(), format!("value{i}").as_bytes()).unwrap();
    }
    for i in (0..400).step_by(2) {
        let key = format!("key{i:05}");
        db.delete(key.as_bytes()).unwrap();
    }
    assert_eq!(db.key_count(), 200);
    for i in 0..400 {
        let key = format!("key{i:05}");
        let got = db.get(key.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "key {i} should be gone");
        } else {
            assert_eq!(got, Some(format!("value{i}").into_bytes()));
        }
    }
}
