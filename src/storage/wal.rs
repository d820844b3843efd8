//! # Write-Ahead Log
//!
//! An append-only redo log. Every mutation is encoded into an in-memory
//! buffer under the log mutex; a background sync thread drains the buffer to
//! `redo.log` and fsyncs it. No page may be written to its home location
//! before the WAL record describing its latest mutation is durable - the
//! checkpointer enforces this by calling `flush(wait = true)` before
//! flushing the node cache.
//!
//! ## Record Format
//!
//! ```text
//! ┌────┬─────────┬─────────┬───────┬───────────────┬─────────┐
//! │ op │ xid(8B) │ klen(1) │ key   │ vlen(4)       │ value   │
//! │ 1B │         │         │       │ insert/update │ only    │
//! └────┴─────────┴─────────┴───────┴───────────────┴─────────┘
//! ```
//!
//! ## Sync Modes
//!
//! - `wal_sync = 0`: the sync thread is signalled on every append.
//! - `wal_sync = 1`: signalled when the buffer reaches
//!   `wal_sync_buffer_size`, on the fixed wake interval, or by an explicit
//!   `flush(wait = true)` (what `Transaction::commit` issues).
//!
//! ## Failure
//!
//! A write or fsync failure on the sync thread marks the log failed, wakes
//! all waiters (their `flush` calls error out), poisons the database and
//! stops the thread.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::encoding::{get_bytes, get_u32, get_u64, get_u8, put_u32, put_u64, put_u8};
use crate::error::DbError;

pub const OP_INSERT: u8 = 1;
pub const OP_UPDATE: u8 = 2;
pub const OP_DELETE: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub op: u8,
    pub xid: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

struct LogState {
    buf: Vec<u8>,
    /// Batches queued so far; `flush(wait)` waits for `synced` to catch up.
    queued: u64,
    synced: u64,
    shutdown: bool,
}

pub struct Logger {
    path: PathBuf,
    wal_sync: u8,
    sync_buffer_size: usize,
    wake_interval: Duration,
    state: Mutex<LogState>,
    work_cv: Condvar,
    done_cv: Condvar,
    file: Mutex<File>,
    recovery: AtomicBool,
    failed: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    pub fn open(
        path: PathBuf,
        wal_sync: u8,
        sync_buffer_size: usize,
        wake_interval_secs: u64,
    ) -> Result<Arc<Self>> {
        let file = Self::open_log_file(&path)?;
        Ok(Arc::new(Self {
            path,
            wal_sync,
            sync_buffer_size,
            wake_interval: Duration::from_secs(wake_interval_secs.max(1)),
            state: Mutex::new(LogState {
                buf: Vec::new(),
                queued: 0,
                synced: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            file: Mutex::new(file),
            recovery: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }))
    }

    fn open_log_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))
    }

    /// Spawns the background sync thread. `poison` is flipped when the
    /// thread dies on an I/O error.
    pub fn start(self: &Arc<Self>, poison: Arc<AtomicBool>) {
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("burrowdb-wal-sync".into())
            .spawn(move || me.sync_loop(poison))
            .expect("failed to spawn WAL sync thread");
        *self.handle.lock() = Some(handle);
    }

    /// Suppresses appends while recovery replays the existing log.
    pub fn set_recovery(&self, on: bool) {
        self.recovery.store(on, Ordering::SeqCst);
    }

    pub fn append(&self, op: u8, xid: u64, key: &[u8], value: Option<&[u8]>) {
        if self.recovery.load(Ordering::SeqCst) {
            return;
        }
        let mut st = self.state.lock();
        put_u8(&mut st.buf, op);
        put_u64(&mut st.buf, xid);
        put_u8(&mut st.buf, key.len() as u8);
        st.buf.extend_from_slice(key);
        if let Some(v) = value {
            put_u32(&mut st.buf, v.len() as u32);
            st.buf.extend_from_slice(v);
        }
        st.queued += 1;

        let wake = match self.wal_sync {
            0 => true,
            _ => st.buf.len() >= self.sync_buffer_size,
        };
        drop(st);
        if wake {
            self.work_cv.notify_one();
        }
    }

    /// Makes everything appended so far durable. With `wait = false` this
    /// only nudges the sync thread.
    pub fn flush(&self, wait: bool) -> Result<()> {
        let mut st = self.state.lock();
        ensure!(
            !self.failed.load(Ordering::SeqCst),
            DbError::Io("WAL sync thread failed".into())
        );
        let target = st.queued;
        if st.buf.is_empty() && st.synced >= target {
            return Ok(());
        }
        self.work_cv.notify_one();
        if wait {
            while st.synced < target {
                if self.failed.load(Ordering::SeqCst) {
                    return Err(DbError::Io("WAL sync thread failed".into()).into());
                }
                self.done_cv.wait(&mut st);
            }
        }
        Ok(())
    }

    fn sync_loop(self: Arc<Self>, poison: Arc<AtomicBool>) {
        loop {
            let (batch, target) = {
                let mut st = self.state.lock();
                if st.buf.is_empty() {
                    if st.shutdown {
                        return;
                    }
                    self.work_cv.wait_for(&mut st, self.wake_interval);
                }
                if st.buf.is_empty() {
                    if st.shutdown {
                        return;
                    }
                    continue;
                }
                (std::mem::take(&mut st.buf), st.queued)
            };

            let res = {
                let file = self.file.lock();
                (&*file)
                    .write_all(&batch)
                    .and_then(|_| file.sync_data())
            };

            let mut st = self.state.lock();
            match res {
                Ok(()) => {
                    st.synced = target;
                    self.done_cv.notify_all();
                }
                Err(e) => {
                    warn!(error = %e, "WAL write failed, stopping sync thread");
                    self.failed.store(true, Ordering::SeqCst);
                    poison.store(true, Ordering::SeqCst);
                    self.done_cv.notify_all();
                    return;
                }
            }
        }
    }

    /// Replaces the log with a fresh empty file. The checkpointer calls
    /// this after dirty pages reached their home locations.
    pub fn reset(&self) -> Result<()> {
        let st = self.state.lock();
        ensure!(
            st.buf.is_empty() && st.synced >= st.queued,
            "WAL reset with unsynced records"
        );
        let mut file = self.file.lock();
        drop(st);
        std::fs::remove_file(&self.path)
            .wrap_err_with(|| format!("failed to unlink WAL '{}'", self.path.display()))?;
        *file = Self::open_log_file(&self.path)?;
        debug!("WAL truncated");
        Ok(())
    }

    /// Reopens the log path after `rebuild()` swapped directories.
    pub fn reopen(&self) -> Result<()> {
        let _st = self.state.lock();
        let mut file = self.file.lock();
        *file = Self::open_log_file(&self.path)?;
        Ok(())
    }

    /// Stops and joins the sync thread, draining the buffer first.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            st.shutdown = true;
        }
        self.work_cv.notify_one();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Decodes every record in a WAL file. A record truncated mid-way is a
/// `BadFile` error; an empty or absent file yields no records.
pub fn read_records(path: &Path) -> Result<Vec<WalRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).wrap_err_with(|| format!("failed to open WAL '{}'", path.display())),
    };
    let len = file.metadata().wrap_err("failed to stat WAL")?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // SAFETY: the mapping is read-only and private to this call; the file is
    // in the database directory, which is exclusively locked by this
    // process.
    let map = unsafe { Mmap::map(&file).wrap_err("failed to mmap WAL")? };
    let mut cur: &[u8] = &map;
    let mut records = Vec::new();
    while !cur.is_empty() {
        let op = get_u8(&mut cur)?;
        ensure!(
            matches!(op, OP_INSERT | OP_UPDATE | OP_DELETE),
            DbError::BadFile(format!("unknown WAL op byte {op:#04x}"))
        );
        let xid = get_u64(&mut cur)?;
        let klen = get_u8(&mut cur)? as usize;
        ensure!(
            klen > 0,
            DbError::BadFile("zero-length key in WAL record".into())
        );
        let key = get_bytes(&mut cur, klen)?.to_vec();
        let value = if op == OP_DELETE {
            None
        } else {
            let vlen = get_u32(&mut cur)? as usize;
            Some(get_bytes(&mut cur, vlen)?.to_vec())
        };
        records.push(WalRecord {
            op,
            xid,
            key,
            value,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_logger(dir: &Path) -> Arc<Logger> {
        let logger = Logger::open(dir.join("redo.log"), 1, 4096, 1).unwrap();
        logger.start(Arc::new(AtomicBool::new(false)));
        logger
    }

    #[test]
    fn appended_records_round_trip_through_the_file() {
        let dir = tempdir().unwrap();
        let logger = open_logger(dir.path());

        logger.append(OP_INSERT, 7, b"alpha", Some(b"one"));
        logger.append(OP_DELETE, 0, b"beta", None);
        logger.flush(true).unwrap();
        logger.shutdown();

        let records = read_records(&dir.path().join("redo.log")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            WalRecord {
                op: OP_INSERT,
                xid: 7,
                key: b"alpha".to_vec(),
                value: Some(b"one".to_vec()),
            }
        );
        assert_eq!(records[1].op, OP_DELETE);
        assert_eq!(records[1].value, None);
    }

    #[test]
    fn flush_wait_blocks_until_durable() {
        let dir = tempdir().unwrap();
        let logger = open_logger(dir.path());

        for i in 0..100u64 {
            logger.append(OP_UPDATE, i, b"key", Some(b"value"));
        }
        logger.flush(true).unwrap();

        let st = logger.state.lock();
        assert!(st.buf.is_empty());
        assert_eq!(st.synced, st.queued);
        drop(st);
        logger.shutdown();
    }

    #[test]
    fn reset_truncates_the_log() {
        let dir = tempdir().unwrap();
        let logger = open_logger(dir.path());
        logger.append(OP_INSERT, 1, b"k", Some(b"v"));
        logger.flush(true).unwrap();
        logger.reset().unwrap();
        logger.shutdown();

        assert!(read_records(&dir.path().join("redo.log"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn appends_during_recovery_are_dropped() {
        let dir = tempdir().unwrap();
        let logger = open_logger(dir.path());
        logger.set_recovery(true);
        logger.append(OP_INSERT, 1, b"k", Some(b"v"));
        logger.set_recovery(false);
        logger.flush(true).unwrap();
        logger.shutdown();

        assert!(read_records(&dir.path().join("redo.log"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn torn_record_is_bad_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        // op + xid, then nothing: key length is missing.
        let mut bytes = vec![OP_INSERT];
        bytes.extend_from_slice(&1u64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = read_records(&path).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(DbError::BadFile(_))
        ));
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempdir().unwrap();
        assert!(read_records(&dir.path().join("redo.log"))
            .unwrap()
            .is_empty());
    }
}
