//! # burrowdb - Embedded Ordered Key-Value Store
//!
//! burrowdb is an embedded, single-process, multi-threaded ordered key-value
//! store backed by a durable on-disk B+tree. Keys are byte strings of 1..=255
//! bytes, values are byte strings of up to 2^32-1 bytes, and both are ordered
//! by a pluggable comparator (lexicographic by default).
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{Db, Options};
//!
//! let db = Db::open("./mydb", Options::default())?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! let mut tx = db.begin()?;
//! tx.put(b"a", b"1")?;
//! tx.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Db / Txn)        │
//! ├──────────────────┬──────────────────┤
//! │  MVCC versions   │ Striped key locks│
//! ├──────────────────┴──────────────────┤
//! │    B+tree (latch-crabbing ops)      │
//! ├─────────────────────────────────────┤
//! │  Node cache (translation table)     │
//! ├─────────────────────────────────────┤
//! │  Pager / overflow allocator / WAL   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each database owns one directory:
//!
//! ```text
//! mydb/
//! ├── dump.db        # header + fixed-size pages (page id = byte offset)
//! ├── redo.log       # append-only WAL, recreated at each checkpoint
//! ├── trx_info       # xid high-water mark, one 8-byte xid per begin()
//! ├── trx_xid_list   # committed xids since the last checkpoint
//! └── lock           # advisory exclusive lock excluding other processes
//! ```
//!
//! ## Durability Model
//!
//! Every mutation is appended to the WAL before any page reaches its home
//! location; dirty pages stay pinned in the node cache until a checkpoint
//! flushes them (WAL fsync happens-before the page writes). Recovery replays
//! WAL records whose transaction committed and then checkpoints the result.
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, overflow-page allocator, WAL, node cache
//! - [`btree`]: node layout and the latch-crabbing tree algorithms
//! - [`mvcc`]: transaction manager, read views, version store, key locks
//! - [`database`]: the `Db` facade, transactions, iterators, checkpointing
//! - [`config`]: open-time options and engine constants
//! - [`encoding`]: fixed-width little-endian codec helpers

pub mod btree;
pub mod config;
pub mod database;
pub mod encoding;
pub mod error;
pub mod mvcc;
pub mod storage;

pub use config::Options;
pub use database::{Db, DbIterator, Transaction};
pub use error::DbError;
