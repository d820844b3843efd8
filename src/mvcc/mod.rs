//! # MVCC and Transactional Concurrency
//!
//! Reads never block on writers: each transaction captures a *read view* on
//! its first read and resolves every key against that snapshot, walking a
//! per-key chain of prior versions when the live tree record is too new.
//! Writers serialize per key through striped exclusive locks.
//!
//! ## Pieces
//!
//! - [`transaction::TransactionManager`]: xid allocation, the active-
//!   transaction map, the checkpoint `blocking` flag, and the two xid
//!   files (`trx_info`, `trx_xid_list`).
//! - [`transaction::ReadView`]: snapshot visibility predicate.
//! - [`version::VersionStore`]: 64-way striped map from key to a
//!   newest-first list of refcounted prior versions, purged asynchronously
//!   when its memory tally crosses a threshold.
//! - [`lock::KeyLockManager`]: 16-way striped shared/exclusive key locks.
//!   Deadlock is neither detected nor prevented; clients locking multiple
//!   keys must order acquisitions consistently or accept potential hangs.
//!
//! ## Isolation
//!
//! Reads are snapshot reads (read view visibility); writes take exclusive
//! key locks with no write-write conflict detection: concurrent writers of
//! the same key serialize on the lock, last committer wins.

pub mod lock;
pub mod transaction;
pub mod version;

pub use lock::KeyLockManager;
pub use transaction::{ReadView, TransactionManager};
pub use version::{VersionRecord, VersionStore};
