//! # Transaction Manager
//!
//! Allocates monotonically increasing transaction ids, tracks the active
//! set, and persists the two xid files:
//!
//! - `trx_info`: one 8-byte xid appended per `begin()`; on open the maximum
//!   seeds the xid counter. Rewritten at checkpoint to just the high-water
//!   mark.
//! - `trx_xid_list`: one 8-byte xid appended per commit; recovery treats
//!   exactly these xids (plus the auto-commit sentinel 0) as committed.
//!   Truncated at each checkpoint.
//!
//! ## Checkpoint Coordination
//!
//! The checkpointer sets `blocking`, which stalls new `begin()` calls, then
//! waits for the active set to drain. Finishing transactions notify the
//! waiting checkpointer when the set empties.
//!
//! ## Read Views
//!
//! A read view is the snapshot a transaction resolves every read against:
//! the sorted set of xids active at capture time, the next xid to be
//! granted, and the capturing xid itself. A record written by `data_id` is
//! visible when it committed before every active transaction, is the
//! reader's own write, or started before the view and was not active in it.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};

pub const TRX_INFO_FILE: &str = "trx_info";
pub const TRX_XID_LIST_FILE: &str = "trx_xid_list";

/// Snapshot used for MVCC visibility checks.
#[derive(Debug, Clone)]
pub struct ReadView {
    /// Sorted xids active when the view was captured.
    trx_ids: Vec<u64>,
    /// First xid not yet granted at capture time.
    up_trx_id: u64,
    /// The capturing transaction.
    create_trx_id: u64,
}

impl ReadView {
    pub fn new(mut trx_ids: Vec<u64>, up_trx_id: u64, create_trx_id: u64) -> Self {
        trx_ids.sort_unstable();
        Self {
            trx_ids,
            up_trx_id,
            create_trx_id,
        }
    }

    pub fn is_visible(&self, data_id: u64) -> bool {
        if let Some(&min) = self.trx_ids.first() {
            if data_id < min {
                return true;
            }
        } else if data_id < self.up_trx_id {
            return true;
        }
        if data_id == self.create_trx_id {
            return true;
        }
        data_id < self.up_trx_id && self.trx_ids.binary_search(&data_id).is_err()
    }
}

struct TrxState {
    next_xid: u64,
    active: BTreeSet<u64>,
    blocking: bool,
}

pub struct TransactionManager {
    state: Mutex<TrxState>,
    /// Wakes `begin()` callers stalled on `blocking`.
    begin_cv: Condvar,
    /// Wakes the checkpointer waiting for the active set to drain.
    drain_cv: Condvar,
    info_path: PathBuf,
    xid_path: PathBuf,
    info_file: Mutex<File>,
    xid_file: Mutex<File>,
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}'", path.display()))
}

fn read_xids(path: &Path) -> Result<Vec<u64>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).wrap_err_with(|| format!("failed to open '{}'", path.display())),
    };
    let len = file.metadata().wrap_err("failed to stat xid file")?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    // SAFETY: read-only private mapping of a file inside the exclusively
    // locked database directory.
    let map = unsafe { Mmap::map(&file).wrap_err("failed to mmap xid file")? };
    Ok(map
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

impl TransactionManager {
    pub fn open(dir: &Path) -> Result<Self> {
        let info_path = dir.join(TRX_INFO_FILE);
        let xid_path = dir.join(TRX_XID_LIST_FILE);
        let next_xid = read_xids(&info_path)?.into_iter().max().unwrap_or(0);
        Ok(Self {
            state: Mutex::new(TrxState {
                next_xid,
                active: BTreeSet::new(),
                blocking: false,
            }),
            begin_cv: Condvar::new(),
            drain_cv: Condvar::new(),
            info_file: Mutex::new(open_append(&info_path)?),
            xid_file: Mutex::new(open_append(&xid_path)?),
            info_path,
            xid_path,
        })
    }

    /// Allocates an xid and registers it active, stalling while a
    /// checkpoint is pending.
    pub fn begin(&self) -> Result<u64> {
        let xid = {
            let mut st = self.state.lock();
            while st.blocking {
                self.begin_cv.wait(&mut st);
            }
            st.next_xid += 1;
            let xid = st.next_xid;
            st.active.insert(xid);
            xid
        };
        self.append_xid(&self.info_file, xid)
            .wrap_err("failed to record new transaction id")?;
        Ok(xid)
    }

    /// Deregisters a finished transaction and wakes a draining
    /// checkpointer.
    pub fn finish(&self, xid: u64) {
        let mut st = self.state.lock();
        st.active.remove(&xid);
        if st.active.is_empty() {
            self.drain_cv.notify_all();
        }
    }

    pub fn set_blocking(&self, blocking: bool) {
        let mut st = self.state.lock();
        st.blocking = blocking;
        if !blocking {
            self.begin_cv.notify_all();
        }
    }

    pub fn wait_no_active(&self) {
        let mut st = self.state.lock();
        while !st.active.is_empty() {
            self.drain_cv.wait(&mut st);
        }
    }

    pub fn has_active(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    /// Captures the read view for `create_xid` (called on its first read).
    pub fn snapshot_view(&self, create_xid: u64) -> ReadView {
        let st = self.state.lock();
        ReadView::new(
            st.active.iter().copied().collect(),
            st.next_xid + 1,
            create_xid,
        )
    }

    /// Appends a committed xid; recovery replays only these.
    pub fn write_committed_xid(&self, xid: u64) -> Result<()> {
        self.append_xid(&self.xid_file, xid)
            .wrap_err("failed to record committed transaction id")
    }

    /// The committed set for recovery: everything in `trx_xid_list` plus
    /// the auto-commit sentinel.
    pub fn committed_xids(&self) -> Result<HashSet<u64>> {
        let mut set: HashSet<u64> = read_xids(&self.xid_path)?.into_iter().collect();
        set.insert(0);
        Ok(set)
    }

    fn append_xid(&self, file: &Mutex<File>, xid: u64) -> Result<()> {
        let file = file.lock();
        (&*file).write_all(&xid.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Checkpoint epilogue: the committed list is obsolete once pages are
    /// flushed, and `trx_info` shrinks to just the xid high-water mark
    /// (written through a temp file so a crash keeps the old one).
    pub fn reset_xid_files(&self) -> Result<()> {
        let next_xid = self.state.lock().next_xid;

        let mut xid_file = self.xid_file.lock();
        std::fs::remove_file(&self.xid_path)
            .wrap_err("failed to unlink committed-xid file")?;
        *xid_file = open_append(&self.xid_path)?;
        drop(xid_file);

        let mut info_file = self.info_file.lock();
        let tmp = self.info_path.with_extension("tmp");
        {
            let mut f = File::create(&tmp).wrap_err("failed to create temp trx_info")?;
            f.write_all(&next_xid.to_le_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.info_path).wrap_err("failed to swap trx_info")?;
        *info_file = open_append(&self.info_path)?;
        Ok(())
    }

    /// Reopens both files after `rebuild()` swapped directories.
    pub fn reopen(&self) -> Result<()> {
        *self.info_file.lock() = open_append(&self.info_path)?;
        *self.xid_file.lock() = open_append(&self.xid_path)?;
        Ok(())
    }
}
