//! # Pager
//!
//! Owns the data file and the header, and hands out pages. Allocation pops
//! the intrusive free-page stack when possible and bumps the file high-water
//! mark otherwise; freeing pushes the page back by writing the current stack
//! head into its first 8 bytes.
//!
//! ## Free-Page Stack
//!
//! ```text
//! header.free_list_head ──> ┌────────────────┐
//!                           │ next (8 bytes) │──> next free page ──> ...
//!                           │ stale payload  │
//!                           └────────────────┘
//! ```
//!
//! When the stack is empty, `free_list_head` points one past the last page
//! ever allocated and allocation advances it by one page.
//!
//! ## Concurrency
//!
//! The header lives under its own mutex (the "header latch"); all header
//! mutations - allocation, freeing, tree-root bookkeeping - go through it.
//! File I/O uses positional reads/writes on a shared handle, so readers
//! never contend with each other; the handle itself sits under an `RwLock`
//! only so `rebuild()` can swap in the freshly built file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard, RwLock};
use zerocopy::IntoBytes;

use super::{DbHeader, PageId, DB_HEADER_SIZE};

pub struct Pager {
    file: RwLock<File>,
    header: Mutex<DbHeader>,
    page_size: usize,
}

impl Pager {
    /// Opens or creates the data file. An existing header wins over the
    /// configured page size; a fresh file is stamped with it.
    pub fn open(path: &Path, configured_page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat data file")?
            .len();

        let header = if len == 0 {
            let header = DbHeader::new(configured_page_size);
            file.write_all_at(header.as_bytes(), 0)
                .wrap_err("failed to write fresh header")?;
            header
        } else {
            let mut buf = [0u8; DB_HEADER_SIZE];
            file.read_exact_at(&mut buf, 0)
                .wrap_err("failed to read header")?;
            DbHeader::from_bytes(&buf)?
        };

        let page_size = header.page_size();
        Ok(Self {
            file: RwLock::new(file),
            header: Mutex::new(header),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The header latch. Acquire before the overflow-allocator latch, never
    /// after it.
    pub fn header(&self) -> MutexGuard<'_, DbHeader> {
        self.header.lock()
    }

    pub fn alloc_page(&self) -> Result<PageId> {
        let mut h = self.header();
        self.alloc_page_locked(&mut h)
    }

    /// Allocation with the header latch already held.
    pub fn alloc_page_locked(&self, h: &mut DbHeader) -> Result<PageId> {
        let id = h.free_list_head();
        if h.free_pages() > 0 {
            let mut next = [0u8; 8];
            self.read_at(&mut next, id)
                .wrap_err("failed to read free-list link")?;
            h.set_free_list_head(u64::from_le_bytes(next));
            h.set_free_pages(h.free_pages() - 1);
        } else {
            h.set_free_list_head(id + self.page_size as u64);
        }
        Ok(id)
    }

    pub fn free_page(&self, id: PageId) -> Result<()> {
        let mut h = self.header();
        self.free_page_locked(&mut h, id)
    }

    pub fn free_page_locked(&self, h: &mut DbHeader, id: PageId) -> Result<()> {
        ensure!(id != 0, "attempted to free the header page");
        self.write_at(&h.free_list_head().to_le_bytes(), id)
            .wrap_err("failed to write free-list link")?;
        h.set_free_list_head(id);
        h.set_free_pages(h.free_pages() + 1);
        Ok(())
    }

    /// Reads a whole page, zero-filling anything past end-of-file. Pages at
    /// the tail of the file may be partially written: a node image only
    /// occupies as many bytes as it serializes to.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let n = self.read_at_partial(&mut buf, id)?;
        // A short read just leaves the zero tail in place.
        let _ = n;
        Ok(buf)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.file.read();
        file.read_exact_at(buf, offset)
            .wrap_err_with(|| format!("short read at offset {offset}"))?;
        Ok(())
    }

    fn read_at_partial(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.read();
        let mut read = 0;
        while read < buf.len() {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("read failed at offset {offset}"))
                }
            }
        }
        Ok(read)
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let file = self.file.read();
        file.write_all_at(data, offset)
            .wrap_err_with(|| format!("write failed at offset {offset}"))?;
        Ok(())
    }

    /// Grows the file so a page-sized region at `offset` is addressable.
    pub fn ensure_len(&self, end: u64) -> Result<()> {
        let file = self.file.read();
        let len = file.metadata().wrap_err("failed to stat data file")?.len();
        if len < end {
            file.set_len(end)
                .wrap_err_with(|| format!("failed to grow data file to {end}"))?;
        }
        Ok(())
    }

    pub fn save_header(&self) -> Result<()> {
        let h = *self.header();
        self.write_at(h.as_bytes(), 0)
            .wrap_err("failed to persist header")
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.read();
        file.sync_all().wrap_err("fsync of data file failed")
    }

    /// Swaps in a replacement data file after `rebuild()` renamed the
    /// rebuilt directory into place. Callers must have quiesced all other
    /// access first.
    pub fn replace_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to reopen data file '{}'", path.display()))?;
        let mut buf = [0u8; DB_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)
            .wrap_err("failed to read rebuilt header")?;
        let header = DbHeader::from_bytes(&buf)?;
        ensure!(
            header.page_size() == self.page_size,
            "rebuilt file changed page size: {} != {}",
            header.page_size(),
            self.page_size
        );
        *self.header.lock() = header;
        *self.file.write() = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pager(page_size: usize) -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("dump.db"), page_size).unwrap();
        (dir, pager)
    }

    #[test]
    fn fresh_file_gets_header_and_page_size() {
        let (_dir, pager) = open_pager(4096);
        assert_eq!(pager.page_size(), 4096);
        assert_eq!(pager.header().free_list_head(), 4096);
    }

    #[test]
    fn existing_header_wins_over_configured_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.db");
        {
            let _pager = Pager::open(&path, 4096).unwrap();
        }
        let pager = Pager::open(&path, 65536).unwrap();
        assert_eq!(pager.page_size(), 4096);
    }

    #[test]
    fn alloc_bumps_high_water_mark() {
        let (_dir, pager) = open_pager(4096);
        let a = pager.alloc_page().unwrap();
        let b = pager.alloc_page().unwrap();
        assert_eq!(a, 4096);
        assert_eq!(b, 8192);
        assert_eq!(pager.header().free_list_head(), 12288);
    }

    #[test]
    fn freed_pages_are_reused_lifo() {
        let (_dir, pager) = open_pager(4096);
        let a = pager.alloc_page().unwrap();
        let b = pager.alloc_page().unwrap();
        pager.free_page(a).unwrap();
        pager.free_page(b).unwrap();
        assert_eq!(pager.header().free_pages(), 2);

        assert_eq!(pager.alloc_page().unwrap(), b);
        assert_eq!(pager.alloc_page().unwrap(), a);
        assert_eq!(pager.header().free_pages(), 0);
    }

    #[test]
    fn free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.db");
        let (a, b) = {
            let pager = Pager::open(&path, 4096).unwrap();
            let a = pager.alloc_page().unwrap();
            let b = pager.alloc_page().unwrap();
            pager.free_page(a).unwrap();
            pager.free_page(b).unwrap();
            pager.save_header().unwrap();
            (a, b)
        };
        let pager = Pager::open(&path, 4096).unwrap();
        assert_eq!(pager.header().free_pages(), 2);
        assert_eq!(pager.alloc_page().unwrap(), b);
        assert_eq!(pager.alloc_page().unwrap(), a);
    }

    #[test]
    fn read_page_zero_fills_past_eof() {
        let (_dir, pager) = open_pager(4096);
        let id = pager.alloc_page().unwrap();
        pager.write_at(b"abc", id).unwrap();
        let page = pager.read_page(id).unwrap();
        assert_eq!(&page[..3], b"abc");
        assert!(page[3..].iter().all(|&b| b == 0));
        assert_eq!(page.len(), 4096);
    }

    #[test]
    fn corrupt_magic_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.db");
        std::fs::write(&path, vec![0xFFu8; 100]).unwrap();
        assert!(Pager::open(&path, 4096).is_err());
    }
}
