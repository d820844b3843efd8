//! # Shared Overflow-Page Allocator
//!
//! Large values keep a fixed prefix in their leaf and spill the rest into
//! overflow pages. Tails big enough to fill whole pages get dedicated "full"
//! pages; the final fragment (when it fits) is packed into a *shared*
//! overflow page alongside fragments of other values.
//!
//! ## Shared Page Layout
//!
//! ```text
//! ┌────────────┬───────┬───────────┬───────────────────────────────┐
//! │ next (8B)  │ avail │ free head │ payload (fragments + free     │
//! │            │ (2B)  │ (2B)      │ blocks, 4-byte granularity)   │
//! └────────────┴───────┴───────────┴───────────────────────────────┘
//! ```
//!
//! Free regions inside the payload form an address-ordered linked list of
//! `(next_free_offset, size)` cells, managed like an explicit-free-list
//! memory allocator: allocation is first-fit with block splitting, freeing
//! coalesces physically adjacent neighbors, and a page whose payload drains
//! completely is unlinked from the overflow list and recycled as a free
//! page.
//!
//! ## In-Memory Index
//!
//! All shared pages are tracked in two maps rebuilt at open by walking the
//! on-disk list: page id -> (prev, next, avail, free head), and
//! avail -> pages, so a write can find the first page with enough room in
//! one ordered-map probe.
//!
//! ## Latching
//!
//! One mutex guards both maps and serializes all shared-page mutation. The
//! header latch is always acquired before it (documented order), because
//! draining or creating a page touches the overflow list head and counters.

use std::collections::BTreeMap;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::DbError;

use super::{
    round4, shared_overflow_capacity, DbHeader, PageId, Pager, OVER_PAGE_HEADER, PAGE_ID_SIZE,
};

#[derive(Debug, Clone, Copy)]
struct OverPage {
    prev: PageId,
    next: PageId,
    avail: u16,
    free_block_head: u16,
}

#[derive(Default)]
struct Maps {
    pages: HashMap<PageId, OverPage>,
    by_avail: BTreeMap<u16, Vec<PageId>>,
}

pub struct OverflowAllocator {
    inner: Mutex<Maps>,
    page_size: usize,
}

impl OverflowAllocator {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(Maps::default()),
            page_size,
        }
    }

    /// Rebuilds the in-memory maps by walking the on-disk overflow list.
    pub fn init(&self, pager: &Pager) -> Result<()> {
        let h = pager.header();
        let mut m = self.inner.lock();
        m.pages.clear();
        m.by_avail.clear();

        let mut prev = 0;
        let mut off = h.over_page_list_head();
        for _ in 0..h.over_pages() {
            ensure!(
                off != 0,
                DbError::BadFile("overflow-page list shorter than header count".into())
            );
            let mut hdr = [0u8; OVER_PAGE_HEADER];
            pager
                .read_at(&mut hdr, off)
                .wrap_err("failed to read overflow page header")?;
            let info = OverPage {
                prev,
                next: u64::from_le_bytes(hdr[0..8].try_into().unwrap()),
                avail: u16::from_le_bytes(hdr[8..10].try_into().unwrap()),
                free_block_head: u16::from_le_bytes(hdr[10..12].try_into().unwrap()),
            };
            m.pages.insert(off, info);
            m.by_avail.entry(info.avail).or_default().push(off);
            prev = off;
            off = info.next;
        }
        Ok(())
    }

    /// Writes `data` into some shared overflow page, creating one if no
    /// existing page has a fitting free block. Returns the page id and the
    /// in-page offset of the written bytes.
    pub fn write_over_page(&self, pager: &Pager, data: &[u8]) -> Result<(PageId, u16)> {
        let cap = shared_overflow_capacity(self.page_size);
        ensure!(
            !data.is_empty() && data.len() <= cap,
            "overflow fragment of {} bytes does not fit a shared page (cap {})",
            data.len(),
            cap
        );
        let round_n = round4(data.len() as u16);

        let mut h = pager.header();
        let mut m = self.inner.lock();

        let candidates: Vec<PageId> = m
            .by_avail
            .range(round_n..)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        for id in candidates {
            if let Some(off) = self.try_write_into(pager, &mut m, id, data, round_n)? {
                return Ok((id, off));
            }
        }

        self.write_new_page(pager, &mut h, &mut m, data, round_n)
    }

    /// First-fit into the free-block list of one page; `None` when no block
    /// is large enough even though the page's total avail suggested a fit.
    fn try_write_into(
        &self,
        pager: &Pager,
        m: &mut Maps,
        id: PageId,
        data: &[u8],
        round_n: u16,
    ) -> Result<Option<u16>> {
        let mut info = *m.pages.get(&id).expect("page indexed but not tracked");
        let page = pager.read_page(id)?;
        let mut blocks = self.read_free_list(&page, info.free_block_head)?;

        let Some(pos) = blocks.iter().position(|&(_, size)| size >= round_n) else {
            return Ok(None);
        };
        let (block_off, block_size) = blocks[pos];

        pager.write_at(data, id + block_off as u64)?;

        if block_size > round_n {
            blocks[pos] = (block_off + round_n, block_size - round_n);
        } else {
            blocks.remove(pos);
        }

        let old_avail = info.avail;
        info.avail -= round_n;
        self.write_free_list(pager, id, &blocks, &mut info)?;

        remove_by_avail(m, id, old_avail);
        if info.avail > 0 {
            m.by_avail.entry(info.avail).or_default().push(id);
        }
        m.pages.insert(id, info);
        Ok(Some(block_off))
    }

    fn write_new_page(
        &self,
        pager: &Pager,
        h: &mut DbHeader,
        m: &mut Maps,
        data: &[u8],
        round_n: u16,
    ) -> Result<(PageId, u16)> {
        let id = pager.alloc_page_locked(h)?;
        pager.ensure_len(id + self.page_size as u64)?;

        let avail = shared_overflow_capacity(self.page_size) as u16 - round_n;
        let free_head = if avail > 0 {
            OVER_PAGE_HEADER as u16 + round_n
        } else {
            0
        };
        let next = h.over_page_list_head();

        let mut buf = Vec::with_capacity(OVER_PAGE_HEADER + round_n as usize + 4);
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(&avail.to_le_bytes());
        buf.extend_from_slice(&free_head.to_le_bytes());
        buf.extend_from_slice(data);
        buf.resize(OVER_PAGE_HEADER + round_n as usize, 0);
        if avail > 0 {
            // One free block covering the rest of the payload.
            buf.extend_from_slice(&0u16.to_le_bytes());
            buf.extend_from_slice(&avail.to_le_bytes());
        }
        pager.write_at(&buf, id)?;

        h.set_over_page_list_head(id);
        h.set_over_pages(h.over_pages() + 1);

        if next != 0 {
            if let Some(n) = m.pages.get_mut(&next) {
                n.prev = id;
            }
        }
        let info = OverPage {
            prev: 0,
            next,
            avail,
            free_block_head: free_head,
        };
        m.pages.insert(id, info);
        m.by_avail.entry(avail).or_default().push(id);
        Ok((id, OVER_PAGE_HEADER as u16))
    }

    /// Releases `n` bytes at `off` inside shared page `id`, coalescing with
    /// adjacent free blocks. A fully drained page is unlinked from the
    /// overflow list and returned to the free-page pool.
    pub fn free_over_page(&self, pager: &Pager, id: PageId, off: u16, n: u16) -> Result<()> {
        ensure!(id != 0, "free_over_page on null page id");
        let rn = round4(n);

        let mut h = pager.header();
        let mut m = self.inner.lock();

        let mut info = *m
            .pages
            .get(&id)
            .ok_or_else(|| DbError::BadFile(format!("page {id} is not a shared overflow page")))?;
        let old_avail = info.avail;
        info.avail += rn;
        let cap = shared_overflow_capacity(self.page_size) as u16;
        ensure!(
            info.avail <= cap,
            DbError::BadFile(format!("overflow page {id} avail overflows capacity"))
        );

        if info.avail == cap {
            if info.prev != 0 {
                pager.write_at(&info.next.to_le_bytes(), info.prev)?;
                if let Some(p) = m.pages.get_mut(&info.prev) {
                    p.next = info.next;
                }
            } else {
                h.set_over_page_list_head(info.next);
            }
            if info.next != 0 {
                if let Some(nx) = m.pages.get_mut(&info.next) {
                    nx.prev = info.prev;
                }
            }
            let new_over_pages = h.over_pages() - 1;
            h.set_over_pages(new_over_pages);
            remove_by_avail(&mut m, id, old_avail);
            m.pages.remove(&id);
            pager.free_page_locked(&mut h, id)?;
            return Ok(());
        }

        let page = pager.read_page(id)?;
        let mut blocks = self.read_free_list(&page, info.free_block_head)?;
        blocks.push((off, rn));
        blocks.sort_unstable_by_key(|&(o, _)| o);

        let mut merged: Vec<(u16, u16)> = Vec::with_capacity(blocks.len());
        for (o, s) in blocks {
            match merged.last_mut() {
                Some((po, ps)) if *po + *ps == o => *ps += s,
                _ => merged.push((o, s)),
            }
        }

        remove_by_avail(&mut m, id, old_avail);
        self.write_free_list(pager, id, &merged, &mut info)?;
        m.by_avail.entry(info.avail).or_default().push(id);
        m.pages.insert(id, info);
        Ok(())
    }

    fn read_free_list(&self, page: &[u8], head: u16) -> Result<Vec<(u16, u16)>> {
        let mut blocks = Vec::new();
        let mut cur = head;
        let limit = self.page_size / 4;
        while cur != 0 {
            ensure!(
                (cur as usize) + 4 <= self.page_size && blocks.len() <= limit,
                DbError::BadFile("corrupt free-block list in shared overflow page".into())
            );
            let at = cur as usize;
            let next = u16::from_le_bytes(page[at..at + 2].try_into().unwrap());
            let size = u16::from_le_bytes(page[at + 2..at + 4].try_into().unwrap());
            blocks.push((cur, size));
            cur = next;
        }
        Ok(blocks)
    }

    /// Rewrites the free-block cells in address order and the page's
    /// avail/head fields.
    fn write_free_list(
        &self,
        pager: &Pager,
        id: PageId,
        blocks: &[(u16, u16)],
        info: &mut OverPage,
    ) -> Result<()> {
        for (i, &(off, size)) in blocks.iter().enumerate() {
            let next = blocks.get(i + 1).map(|&(o, _)| o).unwrap_or(0);
            let mut cell = [0u8; 4];
            cell[0..2].copy_from_slice(&next.to_le_bytes());
            cell[2..4].copy_from_slice(&size.to_le_bytes());
            pager.write_at(&cell, id + off as u64)?;
        }
        info.free_block_head = blocks.first().map(|&(o, _)| o).unwrap_or(0);

        let mut fields = [0u8; 4];
        fields[0..2].copy_from_slice(&info.avail.to_le_bytes());
        fields[2..4].copy_from_slice(&info.free_block_head.to_le_bytes());
        pager.write_at(&fields, id + PAGE_ID_SIZE as u64)
    }
}

fn remove_by_avail(m: &mut Maps, id: PageId, avail: u16) {
    if let Some(ids) = m.by_avail.get_mut(&avail) {
        ids.retain(|&x| x != id);
        if ids.is_empty() {
            m.by_avail.remove(&avail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(page_size: usize) -> (tempfile::TempDir, Pager, OverflowAllocator) {
        let dir = tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("dump.db"), page_size).unwrap();
        let over = OverflowAllocator::new(page_size);
        (dir, pager, over)
    }

    #[test]
    fn first_write_creates_a_shared_page() {
        let (_dir, pager, over) = setup(4096);
        let (id, off) = over.write_over_page(&pager, b"fragment").unwrap();
        assert_ne!(id, 0);
        assert_eq!(off, OVER_PAGE_HEADER as u16);
        assert_eq!(pager.header().over_pages(), 1);
        assert_eq!(pager.header().over_page_list_head(), id);
    }

    #[test]
    fn second_write_packs_into_the_same_page() {
        let (_dir, pager, over) = setup(4096);
        let (id1, off1) = over.write_over_page(&pager, b"aaaa").unwrap();
        let (id2, off2) = over.write_over_page(&pager, b"bbbb").unwrap();
        assert_eq!(id1, id2);
        assert_eq!(off2, off1 + 4);
        assert_eq!(pager.header().over_pages(), 1);

        let page = pager.read_page(id1).unwrap();
        assert_eq!(&page[off1 as usize..off1 as usize + 4], b"aaaa");
        assert_eq!(&page[off2 as usize..off2 as usize + 4], b"bbbb");
    }

    #[test]
    fn draining_a_page_recycles_it() {
        let (_dir, pager, over) = setup(4096);
        let (id, off) = over.write_over_page(&pager, b"only occupant").unwrap();
        over.free_over_page(&pager, id, off, 13).unwrap();

        assert_eq!(pager.header().over_pages(), 0);
        assert_eq!(pager.header().over_page_list_head(), 0);
        assert_eq!(pager.header().free_pages(), 1);
        // The drained page is the next allocation.
        assert_eq!(pager.alloc_page().unwrap(), id);
    }

    #[test]
    fn freed_blocks_coalesce_and_get_reused() {
        let (_dir, pager, over) = setup(4096);
        let (id, a) = over.write_over_page(&pager, &[1u8; 8]).unwrap();
        let (_, b) = over.write_over_page(&pager, &[2u8; 8]).unwrap();
        let (_, c) = over.write_over_page(&pager, &[3u8; 8]).unwrap();
        assert_eq!(b, a + 8);
        assert_eq!(c, b + 8);

        // Free the middle fragment, then the first one; they must merge so
        // a 16-byte fragment fits back at the front.
        over.free_over_page(&pager, id, b, 8).unwrap();
        over.free_over_page(&pager, id, a, 8).unwrap();
        let (id2, off2) = over.write_over_page(&pager, &[4u8; 16]).unwrap();
        assert_eq!(id2, id);
        assert_eq!(off2, a);
    }

    #[test]
    fn in_memory_maps_rebuild_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.db");
        let (id, off);
        {
            let pager = Pager::open(&path, 4096).unwrap();
            let over = OverflowAllocator::new(4096);
            (id, off) = over.write_over_page(&pager, b"persisted").unwrap();
            pager.save_header().unwrap();
        }
        let pager = Pager::open(&path, 4096).unwrap();
        let over = OverflowAllocator::new(4096);
        over.init(&pager).unwrap();

        // Freeing through the rebuilt maps must still drain the page.
        over.free_over_page(&pager, id, off, 9).unwrap();
        assert_eq!(pager.header().over_pages(), 0);
    }

    #[test]
    fn oversized_fragment_is_rejected() {
        let (_dir, pager, over) = setup(4096);
        let too_big = vec![0u8; 4096 - OVER_PAGE_HEADER + 1];
        assert!(over.write_over_page(&pager, &too_big).is_err());
    }
}
