//! Overflow-value handling: bit-exact round trips through overflow chains
//! and page accounting when they are freed.

use burrowdb::{Db, Options};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn opts() -> Options {
    Options {
        page_size: PAGE_SIZE,
        ..Options::default()
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

#[test]
fn ten_page_value_round_trips_bit_exact() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), opts()).unwrap();

    let big = patterned(10 * PAGE_SIZE);
    db.put(b"big", &big).unwrap();
    assert_eq!(db.get(b"big").unwrap(), Some(big));
}

#[test]
fn overflow_pages_are_recycled_after_delete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let db = Db::open(&path, opts()).unwrap();

    let big = patterned(10 * PAGE_SIZE);
    db.put(b"big", &big).unwrap();
    // Checkpoint forces the value onto overflow pages.
    db.checkpoint().unwrap();

    db.delete(b"big").unwrap();
    db.checkpoint().unwrap();

    // Every overflow page the value used is back in the free pool: a new
    // equally large value must not grow the file.
    let len_before = std::fs::metadata(path.join("dump.db")).unwrap().len();
    db.put(b"big2", &big).unwrap();
    db.checkpoint().unwrap();
    let len_after = std::fs::metadata(path.join("dump.db")).unwrap().len();
    assert_eq!(len_before, len_after, "freed overflow pages were not reused");
}

#[test]
fn accounting_balances_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let db = Db::open(&path, opts()).unwrap();
        db.put(b"big", &patterned(10 * PAGE_SIZE)).unwrap();
        db.delete(b"big").unwrap();
    }
    // A clean reopen sees the balanced free list and can serve new writes.
    let db = Db::open(&path, opts()).unwrap();
    assert_eq!(db.key_count(), 0);
    db.put(b"after", &patterned(3 * PAGE_SIZE)).unwrap();
    assert_eq!(db.get(b"after").unwrap(), Some(patterned(3 * PAGE_SIZE)));
}

#[test]
fn updating_a_big_value_frees_the_old_chain() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("db"), opts()).unwrap();

    db.put(b"k", &patterned(5 * PAGE_SIZE)).unwrap();
    db.checkpoint().unwrap();

    let replacement = patterned(6 * PAGE_SIZE);
    db.put(b"k", &replacement).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(replacement));
}

#[test]
fn small_tails_share_overflow_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let db = Db::open(&path, opts()).unwrap();
    let threshold = PAGE_SIZE / 16;

    // Many values slightly over the threshold: each spills a tiny tail
    // that should pack into shared pages rather than one page each.
    for i in 0..64 {
        let key = format!("k{i:03}");
        db.put(key.as_bytes(), &patterned(threshold + 20 + i)).unwrap();
    }
    db.checkpoint().unwrap();

    for i in 0..64 {
        let key = format!("k{i:03}");
        assert_eq!(
            db.get(key.as_bytes()).unwrap(),
            Some(patterned(threshold + 20 + i)),
            "shared-tail value {i} corrupted"
        );
    }

    // 64 tails of ~30 bytes fit in far fewer than 64 pages.
    let file_len = std::fs::metadata(path.join("dump.db")).unwrap().len();
    assert!(
        file_len < (64 * PAGE_SIZE) as u64,
        "tails were not shared: file is {file_len} bytes"
    );
}

#[test]
fn big_values_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let big = patterned(7 * PAGE_SIZE + 123);
    {
        let db = Db::open(&path, opts()).unwrap();
        db.put(b"big", &big).unwrap();
    }
    let db = Db::open(&path, opts()).unwrap();
    assert_eq!(db.get(b"big").unwrap(), Some(big));
}
