//! # Database Facade
//!
//! Binds the storage, tree and transaction layers into the public `Db`
//! handle: open/close on a directory, auto-commit reads and writes,
//! transactions, iterators, checkpointing, crash recovery and rebuild.
//!
//! ## Ownership
//!
//! `Db` exclusively owns (through `DbInner`) the header, the pinned root
//! node, the node cache, the pager, the WAL logger and the transaction
//! manager. Two background threads run for the life of the handle: the WAL
//! sync thread (owned by the logger) and the checkpointer (owned here,
//! holding only a `Weak` reference so dropping the last `Db` can shut it
//! down and join it).
//!
//! ## Write Gate
//!
//! Mutations pass a gate that implements the checkpoint/rebuild stalls: a
//! checkpoint stalls new writes and drains in-flight ones before flushing
//! dirty pages; a rebuild stalls everything. Reads only pass the gate for
//! the rebuild case.
//!
//! ## Poisoning
//!
//! The first I/O failure - in a client operation or on a background
//! thread - flips the database into a poisoned state; every subsequent
//! operation fails with `Poisoned` instead of touching possibly
//! inconsistent state.

mod iter;
mod transaction;

pub use iter::DbIterator;
pub use transaction::Transaction;

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{Result, WrapErr};
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::btree::{Node, NodeCell, NodeRef, ValueRecord};
use crate::config::{overflow_threshold, KeyComparator, Options, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::error::{is_io_failure, DbError};
use crate::mvcc::{KeyLockManager, TransactionManager, VersionStore};
use crate::storage::{
    wal, Logger, NodeCache, OverflowAllocator, Pager, OP_DELETE, OP_INSERT, OP_UPDATE,
};

pub const DATA_FILE: &str = "dump.db";
pub const WAL_FILE: &str = "redo.log";
pub const LOCK_FILE: &str = "lock";

/// Stalls mutations for checkpoints and everything for rebuilds, and
/// counts in-flight operations so either can drain them.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    stall_writes: bool,
    stall_all: bool,
    writers: usize,
    readers: usize,
}

pub(crate) struct WriteTicket<'a> {
    gate: &'a Gate,
}

pub(crate) struct ReadTicket<'a> {
    gate: &'a Gate,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn enter_write(&self) -> WriteTicket<'_> {
        let mut st = self.state.lock();
        while st.stall_writes || st.stall_all {
            self.cv.wait(&mut st);
        }
        st.writers += 1;
        WriteTicket { gate: self }
    }

    pub(crate) fn enter_read(&self) -> ReadTicket<'_> {
        let mut st = self.state.lock();
        while st.stall_all {
            self.cv.wait(&mut st);
        }
        st.readers += 1;
        ReadTicket { gate: self }
    }

    fn stall_writes(&self) {
        let mut st = self.state.lock();
        st.stall_writes = true;
        while st.writers > 0 {
            self.cv.wait(&mut st);
        }
    }

    fn resume_writes(&self) {
        let mut st = self.state.lock();
        st.stall_writes = false;
        drop(st);
        self.cv.notify_all();
    }

    fn stall_all(&self) {
        let mut st = self.state.lock();
        st.stall_all = true;
        while st.writers > 0 || st.readers > 0 {
            self.cv.wait(&mut st);
        }
    }

    fn resume_all(&self) {
        let mut st = self.state.lock();
        st.stall_all = false;
        drop(st);
        self.cv.notify_all();
    }

    fn rebuild_in_progress(&self) -> bool {
        self.state.lock().stall_all
    }
}

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        let mut st = self.gate.state.lock();
        st.writers -= 1;
        drop(st);
        self.gate.cv.notify_all();
    }
}

impl Drop for ReadTicket<'_> {
    fn drop(&mut self) {
        let mut st = self.gate.state.lock();
        st.readers -= 1;
        drop(st);
        self.gate.cv.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Upsert.
    Put,
    /// Strict insert: `KeyExists` when the key is present.
    Insert,
    /// Strict update: `NotFound` when the key is absent.
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub(crate) struct UndoEntry {
    pub op: u8,
    pub key: Vec<u8>,
    /// Prior value for update/delete undo; empty for insert undo.
    pub value: Vec<u8>,
}

/// The slice of transaction state a write needs.
pub(crate) struct TxWrite<'a> {
    pub xid: u64,
    pub xlocked: &'a mut hashbrown::HashSet<Vec<u8>>,
    pub undo: &'a mut SmallVec<[UndoEntry; 8]>,
}

pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) dir: PathBuf,
    pub(crate) comparator: KeyComparator,
    pub(crate) page_size: usize,
    /// The overflow threshold (`page_size / 16`).
    pub(crate) over_value: usize,
    pub(crate) pager: Pager,
    pub(crate) overflow: OverflowAllocator,
    pub(crate) cache: NodeCache,
    /// The root latch; the slot holds the pinned root node.
    pub(crate) root: RwLock<NodeRef>,
    pub(crate) logger: Arc<Logger>,
    pub(crate) txns: TransactionManager,
    pub(crate) versions: VersionStore,
    pub(crate) locks: KeyLockManager,
    pub(crate) gate: Gate,
    pub(crate) poisoned: Arc<AtomicBool>,
    lock_file: Mutex<Option<File>>,
    /// Serializes checkpoints: the scheduled thread, explicit calls, and
    /// the final one at close.
    ck_lock: Mutex<()>,
    ck_shutdown: Mutex<bool>,
    ck_cv: Condvar,
    ck_handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

fn lock_dir(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&path)
        .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(DbError::LockBusy(dir.display().to_string()).into());
        }
        return Err(err).wrap_err("failed to lock database directory");
    }
    Ok(file)
}

fn check_limits(key: &[u8], value: Option<&[u8]>) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(DbError::LimitExceeded(format!(
            "key length must be in 1..={MAX_KEY_LEN}, got {}",
            key.len()
        ))
        .into());
    }
    if let Some(v) = value {
        if v.len() as u64 > MAX_VALUE_LEN {
            return Err(DbError::LimitExceeded(format!(
                "value length must be at most {MAX_VALUE_LEN}, got {}",
                v.len()
            ))
            .into());
        }
    }
    Ok(())
}

/// Appends a suffix to a directory name, keeping it a sibling path.
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut os = dir.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

impl Db {
    /// Opens (or creates) the database directory, recovering from the WAL
    /// if the previous process died before its last checkpoint.
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> Result<Db> {
        opts.validate()?;
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create database directory '{}'", dir.display()))?;
        let lock_file = lock_dir(&dir)?;

        let pager = Pager::open(&dir.join(DATA_FILE), opts.page_size)?;
        let page_size = pager.page_size();
        let over_value = overflow_threshold(page_size);
        let overflow = OverflowAllocator::new(page_size);
        overflow.init(&pager)?;
        let cache = NodeCache::new(opts.cache_slots(), over_value);

        let (root_id, fresh) = {
            let mut h = pager.header();
            if h.root_id() == 0 {
                let id = pager.alloc_page_locked(&mut h)?;
                h.set_root_id(id);
                h.set_leaf_id(id);
                (id, true)
            } else {
                (h.root_id(), false)
            }
        };
        let root = if fresh {
            let mut node = Node::new(true);
            node.refresh(over_value);
            NodeCell::new(root_id, node)
        } else {
            let page = pager.read_page(root_id)?;
            NodeCell::new(root_id, Node::decode(&page, over_value)?)
        };

        let txns = TransactionManager::open(&dir)?;
        let logger = Logger::open(
            dir.join(WAL_FILE),
            opts.wal_sync,
            opts.wal_sync_buffer_size,
            opts.wal_wake_interval,
        )?;
        let comparator = opts.comparator();

        let interval = Duration::from_secs(opts.check_point_interval.max(1));
        let inner = Arc::new(DbInner {
            comparator,
            dir,
            page_size,
            over_value,
            pager,
            overflow,
            cache,
            root: RwLock::new(root),
            logger,
            txns,
            versions: VersionStore::new(),
            locks: KeyLockManager::new(),
            gate: Gate::new(),
            poisoned: Arc::new(AtomicBool::new(false)),
            lock_file: Mutex::new(Some(lock_file)),
            ck_lock: Mutex::new(()),
            ck_shutdown: Mutex::new(false),
            ck_cv: Condvar::new(),
            ck_handle: Mutex::new(None),
            opts,
        });

        inner.logger.start(Arc::clone(&inner.poisoned));

        let booted = (|| {
            let replayed = inner.recover()?;
            if replayed > 0 {
                info!(records = replayed, "WAL recovery complete");
            } else if fresh {
                // Persist the empty root so a crash-free-but-checkpoint-free
                // lifetime still leaves an openable file behind.
                inner.flush_all()?;
            }
            Ok(())
        })();
        if let Err(e) = booted {
            inner.logger.shutdown();
            return Err(e);
        }

        let weak = Arc::downgrade(&inner);
        let handle = std::thread::Builder::new()
            .name("burrowdb-checkpoint".into())
            .spawn(move || checkpoint_loop(weak, interval))
            .wrap_err("failed to spawn checkpoint thread")?;
        *inner.ck_handle.lock() = Some(handle);

        Ok(Db { inner })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.check_usable()?;
        let res = (|| {
            let _ticket = self.inner.gate.enter_read();
            self.inner
                .read_current(key)
                .map(|found| found.map(|(value, _)| value))
        })();
        self.inner.guard_io(res)
    }

    /// Upserts an auto-commit write (xid 0).
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Put, key, Some(value.to_vec()), None)
    }

    /// Strict insert; fails with `KeyExists` when the key is present.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Insert, key, Some(value.to_vec()), None)
    }

    /// Strict update; fails with `NotFound` when the key is absent.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(WriteKind::Update, key, Some(value.to_vec()), None)
    }

    /// Deletes a key; deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(WriteKind::Delete, key, None, None)
    }

    /// Starts a transaction. Blocks while a checkpoint is pending.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.inner.check_usable()?;
        let xid = self.inner.txns.begin()?;
        Ok(Transaction::new(self, xid))
    }

    /// A forward/backward iterator over the leaf chain. It holds the shared
    /// root latch for its lifetime, blocking all writers: release it
    /// promptly.
    pub fn iter(&self) -> DbIterator<'_> {
        DbIterator::new(self)
    }

    /// Number of live keys.
    pub fn key_count(&self) -> u64 {
        self.inner.pager.header().key_nums()
    }

    /// Blocks until every WAL record appended so far is durable.
    pub fn flush_wal(&self) -> Result<()> {
        self.inner.check_usable()?;
        let res = self.inner.logger.flush(true);
        self.inner.guard_io(res)
    }

    /// Forces a checkpoint: WAL fsync, dirty-page flush, WAL truncation.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.check_usable()?;
        let res = self.inner.checkpoint_once();
        self.inner.guard_io(res)
    }

    /// Compacts the database by streaming every pair into a fresh
    /// directory and atomically swapping it in.
    pub fn rebuild(&self) -> Result<()> {
        self.inner.check_usable()?;
        self.inner.gate.stall_all();
        let res = self.inner.rebuild_quiesced();
        self.inner.gate.resume_all();
        self.inner.guard_io(res)
    }

    pub(crate) fn write(
        &self,
        kind: WriteKind,
        key: &[u8],
        value: Option<Vec<u8>>,
        tx: Option<TxWrite<'_>>,
    ) -> Result<()> {
        self.inner.check_usable()?;
        check_limits(key, value.as_deref())?;
        let res = self.inner.do_write(kind, key, value, tx);
        self.inner.guard_io(res)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        {
            let mut shutdown = self.inner.ck_shutdown.lock();
            *shutdown = true;
        }
        self.inner.ck_cv.notify_all();
        if let Some(handle) = self.inner.ck_handle.lock().take() {
            let _ = handle.join();
        }
        if !self.inner.poisoned.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.checkpoint_once() {
                warn!(error = %e, "final checkpoint failed");
            }
        }
        self.inner.logger.shutdown();
        *self.inner.lock_file.lock() = None;
    }
}

impl DbInner {
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(DbError::Poisoned.into());
        }
        Ok(())
    }

    /// Poisons the database when an error carries an I/O failure.
    pub(crate) fn guard_io<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(report) = &res {
            if is_io_failure(report) {
                self.poisoned.store(true, Ordering::SeqCst);
                warn!(error = %report, "fatal i/o failure, database poisoned");
            }
        }
        res
    }

    fn do_write(
        &self,
        kind: WriteKind,
        key: &[u8],
        value: Option<Vec<u8>>,
        mut tx: Option<TxWrite<'_>>,
    ) -> Result<()> {
        let _ticket = self.gate.enter_write();
        let xid = tx.as_ref().map_or(0, |t| t.xid);

        if let Some(t) = tx.as_mut() {
            if !t.xlocked.contains(key) {
                self.locks.lock(t.xid, key, true);
                t.xlocked.insert(key.to_vec());
            }
        }

        let prior = self.read_current(key)?;
        let (effective, wal_op) = match (kind, prior.is_some()) {
            (WriteKind::Delete, false) => return Ok(()),
            (WriteKind::Delete, true) => (WriteKind::Delete, OP_DELETE),
            (WriteKind::Insert, true) => return Err(DbError::KeyExists.into()),
            (WriteKind::Update, false) => return Err(DbError::NotFound.into()),
            (WriteKind::Put | WriteKind::Update, true) => (WriteKind::Update, OP_UPDATE),
            (WriteKind::Put | WriteKind::Insert, false) => (WriteKind::Insert, OP_INSERT),
        };

        // WAL first, then the version the write shadows, then the tree.
        self.logger.append(wal_op, xid, key, value.as_deref());
        if let Some((prior_value, prior_xid)) = &prior {
            self.versions.add(key, prior_value.clone(), *prior_xid);
        }
        if let Some(t) = tx.as_mut() {
            t.undo.push(UndoEntry {
                op: wal_op,
                key: key.to_vec(),
                value: prior.as_ref().map(|(v, _)| v.clone()).unwrap_or_default(),
            });
        }

        match effective {
            WriteKind::Delete => {
                self.tree_erase(key)?;
            }
            _ => {
                let record = ValueRecord::new(value.unwrap_or_default(), xid);
                self.tree_insert(key, record)?;
            }
        }

        // Auto-commit writes in per-record sync mode are durable before
        // returning; transactional writes become durable at commit.
        if tx.is_none() && self.opts.wal_sync == 0 {
            self.logger.flush(true)?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<usize> {
        let records = wal::read_records(&self.dir.join(WAL_FILE))?;
        if records.is_empty() {
            return Ok(0);
        }
        let committed = self.txns.committed_xids()?;
        self.logger.set_recovery(true);
        let mut applied = 0usize;
        for record in &records {
            if !committed.contains(&record.xid) {
                continue;
            }
            match record.op {
                OP_DELETE => {
                    self.tree_erase(&record.key)?;
                }
                _ => {
                    let value = record.value.clone().unwrap_or_default();
                    self.tree_insert(&record.key, ValueRecord::new(value, record.xid))?;
                }
            }
            applied += 1;
        }
        self.logger.set_recovery(false);
        // Persist the recovered state and retire the old log.
        self.checkpoint_once()?;
        Ok(applied)
    }

    pub(crate) fn checkpoint_once(&self) -> Result<()> {
        let _serial = self.ck_lock.lock();
        self.txns.set_blocking(true);
        self.txns.wait_no_active();
        self.gate.stall_writes();
        let res = (|| {
            self.logger.flush(true)?;
            self.flush_all()?;
            self.logger.reset()?;
            self.txns.reset_xid_files()?;
            Ok(())
        })();
        self.gate.resume_writes();
        self.txns.set_blocking(false);
        if res.is_ok() {
            debug!("checkpoint complete");
        }
        res
    }

    pub(crate) fn flush_all(&self) -> Result<()> {
        let root = self.root.read().clone();
        self.cache.flush(&self.pager, &self.overflow, &root)
    }

    fn rebuild_quiesced(&self) -> Result<()> {
        // A checkpoint in flight must finish before the directories move.
        let _serial = self.ck_lock.lock();
        // Block until every iterator releases the tree, and keep new ones
        // out while directories swap underneath.
        let mut slot = self.root.write();

        self.logger.flush(true)?;
        {
            let root = slot.clone();
            self.cache.flush(&self.pager, &self.overflow, &root)?;
        }

        let tmp_dir = sibling(&self.dir, ".tmp");
        let old_dir = sibling(&self.dir, ".old");
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir).wrap_err("failed to clear stale rebuild dir")?;
        }
        if old_dir.exists() {
            std::fs::remove_dir_all(&old_dir).wrap_err("failed to clear stale old dir")?;
        }

        {
            let tmp = Db::open(&tmp_dir, self.opts.clone())?;
            let mut leaf_id = self.pager.header().leaf_id();
            while leaf_id != 0 {
                let node = self.node(leaf_id)?;
                let (pairs, next) = {
                    let guard = node.read();
                    let pairs: Vec<(Vec<u8>, ValueRecord)> = guard
                        .keys
                        .iter()
                        .cloned()
                        .zip(guard.values.iter().cloned())
                        .collect();
                    (pairs, guard.next_leaf)
                };
                for (key, record) in pairs {
                    let value = self.cache.load_real_value(&self.pager, &record)?;
                    tmp.put(&key, &value)?;
                }
                leaf_id = next;
            }
            // Dropping the handle checkpoints the rebuilt database and
            // releases its directory lock.
        }

        *self.lock_file.lock() = None;
        std::fs::rename(&self.dir, &old_dir).wrap_err("failed to move old database aside")?;
        std::fs::rename(&tmp_dir, &self.dir).wrap_err("failed to move rebuilt database in")?;
        std::fs::remove_dir_all(&old_dir).wrap_err("failed to remove old database")?;

        *self.lock_file.lock() = Some(lock_dir(&self.dir)?);
        self.pager.replace_file(&self.dir.join(DATA_FILE))?;
        self.overflow.init(&self.pager)?;
        self.cache.clear();
        self.logger.reopen()?;
        self.txns.reopen()?;

        let root_id = self.pager.header().root_id();
        let page = self.pager.read_page(root_id)?;
        *slot = NodeCell::new(root_id, Node::decode(&page, self.over_value)?);

        info!("rebuild complete");
        Ok(())
    }
}

fn checkpoint_loop(weak: std::sync::Weak<DbInner>, interval: Duration) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut shutdown = inner.ck_shutdown.lock();
            if !*shutdown {
                inner.ck_cv.wait_for(&mut shutdown, interval);
            }
            if *shutdown {
                return;
            }
        }
        if inner.poisoned.load(Ordering::SeqCst) {
            return;
        }
        if inner.gate.rebuild_in_progress() {
            continue;
        }
        let res = inner.checkpoint_once();
        if inner.guard_io(res).is_err() {
            warn!("checkpoint thread stopping after failure");
            return;
        }
    }
}
