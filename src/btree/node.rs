//! # Node Layout
//!
//! One node per page. The in-memory form keeps keys and payloads in plain
//! vectors; the serialized form is the page image described below.
//!
//! ## Page Image
//!
//! ```text
//! ┌─────────┬───────────┬──────────────────────┬───────────────────────┐
//! │ leaf(1) │ count (2) │ keys: (len:1, bytes) │ leaf:  value records  │
//! │         │           │ repeated count times │        prev(8) next(8)│
//! │         │           │                      │ inner: child ids (8×) │
//! └─────────┴───────────┴──────────────────────┴───────────────────────┘
//! ```
//!
//! ## Value Records
//!
//! ```text
//! real_len(4) trx_id(8) payload
//!   payload = inline bytes                      when real_len <= threshold
//!           = over_id(8) page_off(2) prefix     otherwise
//! ```
//!
//! An overflowed value that has not been persisted yet still holds its full
//! bytes in `payload` with `over_page_id == 0`; the checkpoint flush carves
//! the tail into overflow pages and truncates the payload to the prefix.
//!
//! ## Handles
//!
//! Nodes are shared through `NodeRef` handles owned by the node cache (and
//! the pinned root slot). The latch lives inside the handle; `dirty`,
//! `deleted` and `maybe_using` are handle-level atomics so eviction and
//! flush can inspect them without taking the latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::encoding::{
    get_bytes, get_page_id, get_u16, get_u32, get_u64, get_u8, put_page_id, put_u16, put_u32,
    put_u64, put_u8,
};
use crate::error::DbError;
use crate::storage::{
    overflow_prefix_len, PageId, KEY_COUNT_FIELD, KEY_LEN_FIELD, PAGE_ID_SIZE, TRX_ID_FIELD,
    TYPE_FIELD, VALUE_LEN_FIELD,
};

pub type Key = Vec<u8>;

/// Leaf-resident form of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub real_len: u32,
    pub trx_id: u64,
    pub over_page_id: PageId,
    pub page_off: u16,
    pub payload: Vec<u8>,
}

impl ValueRecord {
    pub fn new(value: Vec<u8>, trx_id: u64) -> Self {
        Self {
            real_len: value.len() as u32,
            trx_id,
            over_page_id: 0,
            page_off: 0,
            payload: value,
        }
    }

    pub fn is_overflow(&self, threshold: usize) -> bool {
        self.real_len as usize > threshold
    }

    /// Serialized payload bytes this record contributes to its leaf.
    pub fn inline_len(&self, threshold: usize) -> usize {
        (self.real_len as usize).min(threshold)
    }
}

#[derive(Debug)]
pub struct Node {
    pub leaf: bool,
    pub keys: Vec<Key>,
    pub children: Vec<PageId>,
    pub values: Vec<ValueRecord>,
    pub prev_leaf: PageId,
    pub next_leaf: PageId,
    pub page_used: usize,
}

impl Node {
    pub fn new(leaf: bool) -> Self {
        let mut node = Self {
            leaf,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            prev_leaf: 0,
            next_leaf: 0,
            page_used: 0,
        };
        node.page_used = node.base_used();
        node
    }

    fn base_used(&self) -> usize {
        let mut used = TYPE_FIELD + KEY_COUNT_FIELD;
        if self.leaf {
            used += PAGE_ID_SIZE * 2;
        }
        used
    }

    /// Recomputes `page_used` from the current contents. Call after every
    /// structural mutation; the fullness checks depend on it.
    pub fn refresh(&mut self, threshold: usize) {
        let mut used = self.base_used();
        for key in &self.keys {
            used += KEY_LEN_FIELD + key.len();
        }
        if self.leaf {
            for value in &self.values {
                used += VALUE_LEN_FIELD + TRX_ID_FIELD + value.inline_len(threshold);
            }
        } else {
            used += PAGE_ID_SIZE * self.children.len();
        }
        self.page_used = used;
    }

    /// Serializes the node into a page image. Overflowed values must have
    /// been persisted first so their payload is exactly the prefix.
    pub fn encode(&self, threshold: usize, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        buf.reserve(self.page_used);
        put_u8(buf, self.leaf as u8);
        put_u16(buf, self.keys.len() as u16);
        for key in &self.keys {
            put_u8(buf, key.len() as u8);
            buf.extend_from_slice(key);
        }
        if self.leaf {
            ensure!(
                self.keys.len() == self.values.len(),
                "leaf with {} keys but {} values",
                self.keys.len(),
                self.values.len()
            );
            for value in &self.values {
                put_u32(buf, value.real_len);
                put_u64(buf, value.trx_id);
                if value.is_overflow(threshold) {
                    ensure!(
                        value.over_page_id != 0
                            && value.payload.len() == overflow_prefix_len(threshold),
                        "encoding an overflow value that was never persisted"
                    );
                    put_page_id(buf, value.over_page_id);
                    put_u16(buf, value.page_off);
                }
                buf.extend_from_slice(&value.payload);
            }
            put_page_id(buf, self.prev_leaf);
            put_page_id(buf, self.next_leaf);
        } else {
            ensure!(
                self.keys.len() == self.children.len(),
                "interior with {} keys but {} children",
                self.keys.len(),
                self.children.len()
            );
            for &child in &self.children {
                put_page_id(buf, child);
            }
        }
        Ok(())
    }

    pub fn decode(page: &[u8], threshold: usize) -> Result<Self> {
        let mut cur = page;
        let leaf = match get_u8(&mut cur)? {
            0 => false,
            1 => true,
            other => {
                return Err(
                    DbError::BadFile(format!("invalid node type byte {other:#04x}")).into(),
                )
            }
        };
        let count = get_u16(&mut cur)? as usize;

        let mut node = Node::new(leaf);
        node.keys.reserve(count);
        for _ in 0..count {
            let klen = get_u8(&mut cur)? as usize;
            ensure!(klen > 0, DbError::BadFile("zero-length key in node".into()));
            node.keys.push(get_bytes(&mut cur, klen)?.to_vec());
        }
        if leaf {
            node.values.reserve(count);
            for _ in 0..count {
                let real_len = get_u32(&mut cur)?;
                let trx_id = get_u64(&mut cur)?;
                let mut record = ValueRecord {
                    real_len,
                    trx_id,
                    over_page_id: 0,
                    page_off: 0,
                    payload: Vec::new(),
                };
                if real_len as usize <= threshold {
                    record.payload = get_bytes(&mut cur, real_len as usize)?.to_vec();
                } else {
                    record.over_page_id = get_page_id(&mut cur)?;
                    record.page_off = get_u16(&mut cur)?;
                    record.payload = get_bytes(&mut cur, overflow_prefix_len(threshold))?.to_vec();
                }
                node.values.push(record);
            }
            node.prev_leaf = get_page_id(&mut cur)?;
            node.next_leaf = get_page_id(&mut cur)?;
        } else {
            node.children.reserve(count);
            for _ in 0..count {
                node.children.push(get_page_id(&mut cur)?);
            }
        }
        node.refresh(threshold);
        Ok(node)
    }
}

pub type NodeReadGuard =
    parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, Node>;
pub type NodeWriteGuard =
    parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, Node>;

/// Shared handle to a cached node. The page id is fixed for the node's
/// lifetime; a node promoted to (or demoted from) the root slot keeps it.
pub struct NodeCell {
    pub id: PageId,
    dirty: AtomicBool,
    deleted: AtomicBool,
    maybe_using: AtomicBool,
    data: Arc<RwLock<Node>>,
}

pub type NodeRef = Arc<NodeCell>;

impl NodeCell {
    pub fn new(id: PageId, node: Node) -> NodeRef {
        Arc::new(Self {
            id,
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            maybe_using: AtomicBool::new(false),
            data: Arc::new(RwLock::new(node)),
        })
    }

    pub fn read(&self) -> NodeReadGuard {
        self.data.read_arc()
    }

    pub fn write(&self) -> NodeWriteGuard {
        self.data.write_arc()
    }

    pub fn try_write(&self) -> Option<NodeWriteGuard> {
        self.data.try_write_arc()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Set whenever the cache hands the node out; cleared at checkpoint
    /// flush. A node with this flag set is never evicted, which closes the
    /// window between a lookup and the first latch acquisition.
    pub fn mark_using(&self) {
        self.maybe_using.store(true, Ordering::Release);
    }

    pub fn clear_using(&self) {
        self.maybe_using.store(false, Ordering::Release);
    }

    pub fn in_use(&self) -> bool {
        self.maybe_using.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCell")
            .field("id", &self.id)
            .field("dirty", &self.is_dirty())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
