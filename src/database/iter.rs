//! # Iterator
//!
//! Walks the leaf chain in comparator order, forward or backward. The
//! iterator holds the shared root latch for its whole lifetime so the tree
//! shape cannot change underneath it; since writers take that latch
//! exclusively, an open iterator blocks all mutations - release it
//! promptly.
//!
//! Positions are (leaf page id, slot index). A backward step that crosses
//! to the previous leaf parks the index at a "last slot" sentinel resolved
//! lazily, because the previous leaf's length is unknown until the node is
//! latched. Nodes freed by a concurrent merge are detected through their
//! `deleted` flag (the chain is immutable while the iterator lives, but a
//! position can outlive its node across seeks).

use eyre::Result;
use parking_lot::RwLockReadGuard;

use crate::btree::NodeRef;
use crate::storage::PageId;

use super::Db;

/// Index sentinel for "last entry of the node, whatever its length".
const LAST_SLOT: isize = -1;

pub struct DbIterator<'db> {
    db: &'db Db,
    /// The shared root latch, held for the iterator's lifetime.
    root: RwLockReadGuard<'db, NodeRef>,
    page_id: PageId,
    at: isize,
    saved_key: Vec<u8>,
}

impl<'db> DbIterator<'db> {
    pub(crate) fn new(db: &'db Db) -> Self {
        let root = db.inner.root.read();
        Self {
            db,
            root,
            page_id: 0,
            at: 0,
            saved_key: Vec::new(),
        }
    }

    pub fn valid(&self) -> bool {
        self.page_id != 0
    }

    fn resolve(&self) -> Result<Option<NodeRef>> {
        if self.page_id == 0 {
            return Ok(None);
        }
        // A single-leaf tree chains through the pinned root itself.
        if self.root.id == self.page_id {
            return Ok(Some(NodeRef::clone(&self.root)));
        }
        self.db.inner.node(self.page_id).map(Some)
    }

    /// Positions at an exactly matching key; invalidates when absent.
    pub fn seek(&mut self, key: &[u8]) -> Result<&mut Self> {
        let inner = &*self.db.inner;
        match inner.find_exact(&self.root, key)? {
            Some((page_id, at)) => {
                self.page_id = page_id;
                self.at = at as isize;
            }
            None => self.page_id = 0,
        }
        Ok(self)
    }

    pub fn seek_first(&mut self) -> Result<&mut Self> {
        let h = self.db.inner.pager.header();
        if h.key_nums() > 0 {
            self.page_id = h.leaf_id();
            self.at = 0;
        } else {
            self.page_id = 0;
        }
        Ok(self)
    }

    pub fn seek_last(&mut self) -> Result<&mut Self> {
        match self.db.inner.last_position(&self.root)? {
            Some((page_id, at)) => {
                self.page_id = page_id;
                self.at = at as isize;
            }
            None => self.page_id = 0,
        }
        Ok(self)
    }

    pub fn next(&mut self) -> Result<&mut Self> {
        let Some(node) = self.resolve()? else {
            return Ok(self);
        };
        let guard = node.read();
        if node.is_deleted() {
            self.page_id = 0;
            return Ok(self);
        }
        let at = if self.at == LAST_SLOT {
            guard.keys.len().saturating_sub(1)
        } else {
            self.at as usize
        };
        if at + 1 < guard.keys.len() {
            self.at = (at + 1) as isize;
        } else {
            self.page_id = guard.next_leaf;
            self.at = 0;
        }
        Ok(self)
    }

    pub fn prev(&mut self) -> Result<&mut Self> {
        let Some(node) = self.resolve()? else {
            return Ok(self);
        };
        let guard = node.read();
        if node.is_deleted() {
            self.page_id = 0;
            return Ok(self);
        }
        let at = if self.at == LAST_SLOT {
            guard.keys.len().saturating_sub(1)
        } else {
            self.at as usize
        };
        if at > 0 {
            self.at = (at - 1) as isize;
        } else {
            self.page_id = guard.prev_leaf;
            self.at = LAST_SLOT;
        }
        Ok(self)
    }

    /// The key at the current position, or `None` when invalid.
    pub fn key(&mut self) -> Result<Option<&[u8]>> {
        let Some(node) = self.resolve()? else {
            return Ok(None);
        };
        let guard = node.read();
        if node.is_deleted() || guard.keys.is_empty() {
            self.page_id = 0;
            return Ok(None);
        }
        let at = if self.at == LAST_SLOT {
            guard.keys.len() - 1
        } else {
            self.at as usize
        };
        self.saved_key.clear();
        self.saved_key.extend_from_slice(&guard.keys[at]);
        drop(guard);
        Ok(Some(&self.saved_key))
    }

    /// The value at the current position, fully materialized under the
    /// node latch so its overflow chain cannot be freed mid-walk.
    pub fn value(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(node) = self.resolve()? else {
            return Ok(None);
        };
        let guard = node.read();
        if node.is_deleted() || guard.values.is_empty() {
            self.page_id = 0;
            return Ok(None);
        }
        let at = if self.at == LAST_SLOT {
            guard.values.len() - 1
        } else {
            self.at as usize
        };
        let inner = &*self.db.inner;
        let value = inner
            .cache
            .load_real_value(&inner.pager, &guard.values[at])?;
        Ok(Some(value))
    }
}
