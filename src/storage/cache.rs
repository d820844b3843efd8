//! # Node Cache (Translation Table)
//!
//! Maps page ids to in-memory nodes with LRU eviction. Everything except the
//! pinned root goes through here: a lookup either returns the cached handle
//! or loads the page, decodes it, and inserts it at the MRU position.
//!
//! ## Eviction
//!
//! Only the LRU tail is ever considered, and it is skipped when it is
//! dirty, logically deleted, currently latched, or marked `maybe_using`.
//! Dirty nodes are therefore *pinned*: they reach disk only at checkpoint
//! flush, preserving the WAL-first ordering (the cache never writes a page
//! whose WAL record has not been fsynced). `maybe_using` is set on every
//! lookup and cleared by `flush`, closing the window between a lookup and
//! the first latch acquisition on the returned handle.
//!
//! ## Value Persistence
//!
//! The cache also owns the value spill/load/free paths:
//!
//! - `persist_value` carves an overflowed value into full overflow pages
//!   plus at most one shared-page fragment, and truncates the leaf payload
//!   to the prefix;
//! - `load_real_value` materializes full bytes by walking the chain;
//! - `free_value` returns every page the chain used.
//!
//! ## Flush
//!
//! `flush` saves every dirty non-deleted node, always rewrites the root
//! page and the header, then fsyncs the data file. It runs only while
//! writers are quiesced (checkpoint, recovery, close).

use std::collections::BTreeMap;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::btree::{Node, NodeCell, NodeRef, ValueRecord};
use crate::error::DbError;

use super::{
    full_overflow_capacity, overflow_prefix_len, shared_overflow_capacity, OverflowAllocator,
    PageId, Pager, PAGE_ID_SIZE,
};

struct Slot {
    node: NodeRef,
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<PageId, Slot>,
    order: BTreeMap<u64, PageId>,
    tick: u64,
}

pub struct NodeCache {
    inner: RwLock<CacheInner>,
    cap: usize,
    threshold: usize,
}

impl NodeCache {
    pub fn new(cap: usize, threshold: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            cap,
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a page id to its node, loading it on a miss. The returned
    /// handle is marked `maybe_using` so it survives until the next flush.
    pub fn to_node(&self, pager: &Pager, id: PageId) -> Result<NodeRef> {
        let mut inner = self.inner.write();
        if let Some(node) = Self::touch(&mut inner, id) {
            node.mark_using();
            return Ok(node);
        }
        let node = self.load_node(pager, id)?;
        Self::put(&mut inner, self.cap, id, node.clone());
        node.mark_using();
        Ok(node)
    }

    /// Inserts a node the caller just created (split, demoted root).
    pub fn insert(&self, id: PageId, node: NodeRef) {
        let mut inner = self.inner.write();
        node.mark_using();
        Self::put(&mut inner, self.cap, id, node);
    }

    /// Drops a node from the table, returning its handle (merge victims,
    /// root promotion).
    pub fn remove(&self, id: PageId) -> Option<NodeRef> {
        let mut inner = self.inner.write();
        let slot = inner.map.remove(&id)?;
        inner.order.remove(&slot.tick);
        Some(slot.node)
    }

    fn touch(inner: &mut CacheInner, id: PageId) -> Option<NodeRef> {
        let tick = inner.tick + 1;
        let slot = inner.map.get_mut(&id)?;
        let old = slot.tick;
        slot.tick = tick;
        let node = slot.node.clone();
        inner.tick = tick;
        inner.order.remove(&old);
        inner.order.insert(tick, id);
        Some(node)
    }

    fn put(inner: &mut CacheInner, cap: usize, id: PageId, node: NodeRef) {
        debug_assert!(!inner.map.contains_key(&id), "page {id} already cached");
        if inner.map.len() >= cap {
            Self::try_evict(inner);
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, id);
        inner.map.insert(id, Slot { node, tick });
    }

    /// Examines only the LRU tail; gives up rather than scanning, so a hot
    /// tail lets the cache run slightly over capacity until the next put.
    fn try_evict(inner: &mut CacheInner) {
        let Some((&tick, &id)) = inner.order.first_key_value() else {
            return;
        };
        let node = inner.map[&id].node.clone();
        if node.is_dirty() || node.is_deleted() || node.in_use() {
            return;
        }
        let Some(_guard) = node.try_write() else {
            return;
        };
        trace!(page = id, "evicting clean node");
        inner.order.remove(&tick);
        inner.map.remove(&id);
    }

    fn load_node(&self, pager: &Pager, id: PageId) -> Result<NodeRef> {
        let page = pager
            .read_page(id)
            .wrap_err_with(|| format!("failed to load node page {id}"))?;
        let node = Node::decode(&page, self.threshold)
            .wrap_err_with(|| format!("failed to decode node page {id}"))?;
        Ok(NodeCell::new(id, node))
    }

    /// Serializes one node to its page, spilling any still-unpersisted
    /// overflow values first.
    pub fn save_node(
        &self,
        pager: &Pager,
        overflow: &OverflowAllocator,
        cell: &NodeCell,
    ) -> Result<()> {
        let mut node = cell.write();
        if node.leaf {
            for value in node.values.iter_mut() {
                self.persist_value(pager, overflow, value)?;
            }
        }
        let mut buf = Vec::new();
        node.encode(self.threshold, &mut buf)?;
        ensure!(
            buf.len() <= pager.page_size(),
            "node {} serialized to {} bytes, over the {} page size",
            cell.id,
            buf.len(),
            pager.page_size()
        );
        // A partially filled page leaves a hole; that is fine.
        pager.write_at(&buf, cell.id)
    }

    /// Writes every dirty node, the root, and the header, then fsyncs.
    pub fn flush(
        &self,
        pager: &Pager,
        overflow: &OverflowAllocator,
        root: &NodeRef,
    ) -> Result<()> {
        let nodes: Vec<NodeRef> = {
            let inner = self.inner.read();
            inner.map.values().map(|s| s.node.clone()).collect()
        };
        for node in &nodes {
            if node.is_deleted() {
                continue;
            }
            if node.is_dirty() {
                self.save_node(pager, overflow, node)?;
                node.clear_dirty();
            }
            node.clear_using();
        }
        // The root is rewritten unconditionally so a fresh database can be
        // reopened even if nothing marked it dirty.
        self.save_node(pager, overflow, root)?;
        root.clear_dirty();
        pager.save_header()?;
        pager.sync()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.order.clear();
    }

    /// Splits a too-large value into its persistent overflow form: a chain
    /// of full pages, then at most one shared-page fragment, with the leaf
    /// keeping a fixed prefix. No-op for inline or already-placed values.
    pub fn persist_value(
        &self,
        pager: &Pager,
        overflow: &OverflowAllocator,
        value: &mut ValueRecord,
    ) -> Result<()> {
        if !value.is_overflow(self.threshold) || value.over_page_id != 0 {
            return Ok(());
        }
        let page_size = pager.page_size();
        let prefix_len = overflow_prefix_len(self.threshold);
        let cap_full = full_overflow_capacity(page_size);
        let cap_shared = shared_overflow_capacity(page_size);

        let data = std::mem::take(&mut value.payload);
        ensure!(
            data.len() == value.real_len as usize,
            "overflow value holds {} bytes but claims {}",
            data.len(),
            value.real_len
        );
        let tail = &data[prefix_len..];

        let full_chunks = tail.len() / cap_full;
        let mut rest = tail.len() % cap_full;
        let mut chunks: Vec<&[u8]> = (0..full_chunks)
            .map(|i| &tail[i * cap_full..(i + 1) * cap_full])
            .collect();
        if rest > cap_shared {
            // The remainder is too big to share a page; give it a full one.
            chunks.push(&tail[tail.len() - rest..]);
            rest = 0;
        }

        let mut shared_page = 0;
        if rest > 0 {
            let (id, off) = overflow.write_over_page(pager, &tail[tail.len() - rest..])?;
            shared_page = id;
            value.page_off = off;
        }

        if chunks.is_empty() {
            value.over_page_id = shared_page;
        } else {
            let first = pager.alloc_page()?;
            value.over_page_id = first;
            let mut at = first;
            for (i, chunk) in chunks.iter().enumerate() {
                let next = if i + 1 == chunks.len() {
                    shared_page
                } else {
                    pager.alloc_page()?
                };
                let mut buf = Vec::with_capacity(PAGE_ID_SIZE + chunk.len());
                buf.extend_from_slice(&next.to_le_bytes());
                buf.extend_from_slice(chunk);
                pager.write_at(&buf, at)?;
                at = next;
            }
        }

        value.payload = data[..prefix_len].to_vec();
        Ok(())
    }

    /// Materializes the complete value bytes, walking the overflow chain if
    /// the record was spilled.
    pub fn load_real_value(&self, pager: &Pager, value: &ValueRecord) -> Result<Vec<u8>> {
        if value.over_page_id == 0 {
            // Inline, or an overflow value that has not been spilled yet
            // and still holds its full bytes.
            return Ok(value.payload.clone());
        }
        let page_size = pager.page_size();
        let prefix_len = overflow_prefix_len(self.threshold);
        let cap_full = full_overflow_capacity(page_size);
        let cap_shared = shared_overflow_capacity(page_size);

        let mut out = Vec::with_capacity(value.real_len as usize);
        out.extend_from_slice(&value.payload);
        let mut remaining = value.real_len as usize - prefix_len;
        let mut at = value.over_page_id;
        loop {
            ensure!(
                at != 0,
                DbError::BadFile("overflow chain ended before the value did".into())
            );
            let page = pager.read_page(at)?;
            let next = u64::from_le_bytes(page[..PAGE_ID_SIZE].try_into().unwrap());
            if remaining >= cap_full {
                out.extend_from_slice(&page[PAGE_ID_SIZE..PAGE_ID_SIZE + cap_full]);
                remaining -= cap_full;
                if remaining == 0 {
                    break;
                }
                at = next;
            } else {
                if remaining <= cap_shared {
                    let start = value.page_off as usize;
                    out.extend_from_slice(&page[start..start + remaining]);
                } else {
                    out.extend_from_slice(&page[PAGE_ID_SIZE..PAGE_ID_SIZE + remaining]);
                }
                break;
            }
        }
        ensure!(
            out.len() == value.real_len as usize,
            DbError::BadFile("overflow chain shorter than the value length".into())
        );
        Ok(out)
    }

    /// Frees every overflow page the record's chain used. The accounting
    /// mirrors `persist_value`: full pages are freed outright, the final
    /// fragment is released into its shared page.
    pub fn free_value(
        &self,
        pager: &Pager,
        overflow: &OverflowAllocator,
        value: &ValueRecord,
    ) -> Result<()> {
        if value.over_page_id == 0 {
            return Ok(());
        }
        let page_size = pager.page_size();
        let cap_full = full_overflow_capacity(page_size);
        let cap_shared = shared_overflow_capacity(page_size);

        let mut remaining = value.real_len as usize - overflow_prefix_len(self.threshold);
        let mut at = value.over_page_id;
        loop {
            ensure!(
                at != 0,
                DbError::BadFile("overflow chain ended while freeing".into())
            );
            let mut link = [0u8; PAGE_ID_SIZE];
            pager.read_at(&mut link, at)?;
            let next = u64::from_le_bytes(link);
            if remaining >= cap_full {
                pager.free_page(at)?;
                remaining -= cap_full;
                if remaining == 0 {
                    break;
                }
                at = next;
            } else {
                if remaining <= cap_shared {
                    overflow.free_over_page(pager, at, value.page_off, remaining as u16)?;
                } else {
                    pager.free_page(at)?;
                }
                break;
            }
        }
        Ok(())
    }
}
