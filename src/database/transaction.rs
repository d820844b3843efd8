//! # Transactions
//!
//! A `Transaction` groups reads and writes under one xid. Reads are MVCC
//! snapshot reads against a view captured on the first read; writes take
//! exclusive key locks, append redo records under the transaction's xid,
//! and push inverse operations onto an undo stack.
//!
//! ## Commit
//!
//! `commit` makes the WAL durable (only if the transaction wrote), releases
//! every key lock, drops the version references the read path retained,
//! appends the xid to the committed list and deregisters the transaction.
//!
//! ## Rollback
//!
//! `rollback` replays the undo stack in reverse through the auto-commit
//! write path: the undo of an insert is a delete, the undo of an update or
//! delete re-puts the prior value. The undo records land in the WAL like
//! any other auto-commit write, while the transaction's own xid is *not*
//! appended to the committed list - recovery skips the original writes and
//! the replayed undos are idempotent against the pre-transaction state.
//! Dropping an unfinished transaction rolls it back.

use eyre::Result;
use hashbrown::HashSet;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::warn;

use crate::mvcc::{ReadView, VersionRecord};
use crate::storage::{OP_DELETE, OP_INSERT, OP_UPDATE};

use super::{Db, TxWrite, UndoEntry, WriteKind};

pub struct Transaction<'db> {
    db: &'db Db,
    xid: u64,
    view: Option<ReadView>,
    undo: SmallVec<[UndoEntry; 8]>,
    xlocked: HashSet<Vec<u8>>,
    version_refs: Vec<Arc<VersionRecord>>,
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Db, xid: u64) -> Self {
        Self {
            db,
            xid,
            view: None,
            undo: SmallVec::new(),
            xlocked: HashSet::new(),
            version_refs: Vec::new(),
            finished: false,
        }
    }

    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Snapshot read. Self-written keys read the live tree (a self-delete
    /// reads as absent); otherwise the live record wins when its writer is
    /// visible, then the newest visible stored version, then absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &*self.db.inner;
        inner.check_usable()?;
        let res = (|| {
            let _ticket = inner.gate.enter_read();
            let xid = self.xid;
            let view = self
                .view
                .get_or_insert_with(|| inner.txns.snapshot_view(xid));

            if self.xlocked.contains(key) {
                return Ok(inner.read_current(key)?.map(|(value, _)| value));
            }

            if let Some((value, writer)) = inner.read_current(key)? {
                if view.is_visible(writer) {
                    return Ok(Some(value));
                }
            }
            if let Some(version) = inner.versions.visible(key, view) {
                let value = version.value.clone();
                self.version_refs.push(version);
                return Ok(Some(value));
            }
            Ok(None)
        })();
        inner.guard_io(res)
    }

    /// Upsert under this transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Put, key, Some(value.to_vec()))
    }

    /// Strict insert; `KeyExists` when the key is present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Insert, key, Some(value.to_vec()))
    }

    /// Strict update; `NotFound` when the key is absent.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Update, key, Some(value.to_vec()))
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.write(WriteKind::Delete, key, None)
    }

    fn write(&mut self, kind: WriteKind, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        debug_assert!(!self.finished);
        let ctx = TxWrite {
            xid: self.xid,
            xlocked: &mut self.xlocked,
            undo: &mut self.undo,
        };
        self.db.write(kind, key, value, Some(ctx))
    }

    pub fn commit(mut self) -> Result<()> {
        let res = self.commit_inner();
        self.finished = true;
        res
    }

    fn commit_inner(&mut self) -> Result<()> {
        let inner = &*self.db.inner;
        let res = match inner.check_usable() {
            Err(e) => Err(e),
            Ok(()) => (|| {
                if !self.undo.is_empty() {
                    inner.logger.flush(true)?;
                }
                inner.txns.write_committed_xid(self.xid)?;
                Ok(())
            })(),
        };
        // Locks and the active-set entry are released even on failure so
        // other transactions and the checkpointer are not wedged.
        self.release();
        inner.guard_io(res)
    }

    pub fn rollback(mut self) -> Result<()> {
        let res = self.rollback_inner();
        self.finished = true;
        res
    }

    fn rollback_inner(&mut self) -> Result<()> {
        let inner = &*self.db.inner;
        let entries: Vec<UndoEntry> = self.undo.drain(..).collect();
        let res = match inner.check_usable() {
            Err(e) => Err(e),
            Ok(()) => (|| {
                for entry in entries.iter().rev() {
                    match entry.op {
                        OP_INSERT => {
                            self.db.write(WriteKind::Delete, &entry.key, None, None)?;
                        }
                        OP_UPDATE | OP_DELETE => {
                            self.db.write(
                                WriteKind::Put,
                                &entry.key,
                                Some(entry.value.clone()),
                                None,
                            )?;
                        }
                        other => unreachable!("unknown undo op {other}"),
                    }
                }
                Ok(())
            })(),
        };
        self.release();
        inner.guard_io(res)
    }

    /// Common epilogue: key locks, version references, active-set entry.
    fn release(&mut self) {
        let inner = &*self.db.inner;
        for key in self.xlocked.drain() {
            inner.locks.unlock(self.xid, &key);
        }
        self.version_refs.clear();
        self.view = None;
        inner.txns.finish(self.xid);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.rollback_inner() {
                warn!(xid = self.xid, error = %e, "implicit rollback failed");
            }
            self.finished = true;
        }
    }
}
