//! # Tree Algorithms
//!
//! Top-down latch crabbing over the node graph. Writers take the exclusive
//! root latch for the whole mutation and crab node latches downward,
//! splitting (insert) or rebalancing (erase) preemptively so a child latch
//! can always replace its parent's. Readers latch the root node under a
//! shared root latch, then crab shared latches down, holding at most two at
//! a time.
//!
//! ## Split Types
//!
//! A mid split leaves both halves half-full, which wastes half of every
//! page under append-only workloads. Leaves at either end of the chain
//! split at the insertion point instead:
//!
//! ```text
//! right-insert:  [1 2 3] + 4  ->  [3 4]          left-insert:  [2 3 4] + 1  ->  [1 4]
//!                                /     \                                      /     \
//!                            [1 2 3] -> [4]                               [1] -> [2 3 4]
//! ```
//!
//! ## Separator Maintenance
//!
//! `keys[i]` of an interior node is the exact maximum of child `i`'s
//! subtree. Inserting a key beyond every separator stretches the last one;
//! deleting a key that *is* a separator replaces it with the second-largest
//! key of the subtree, read from the predecessor leaf, which stays
//! exclusively latched for the remainder of the descent.

use eyre::{bail, ensure, Result};

use crate::database::DbInner;
use crate::storage::{
    PageId, KEY_LEN_FIELD, PAGE_ID_SIZE, TRX_ID_FIELD, VALUE_LEN_FIELD,
};
use crate::config::MAX_KEY_LEN;

use super::node::{Node, NodeCell, NodeRef, NodeWriteGuard, ValueRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitType {
    Mid,
    LeftInsert,
    RightInsert,
}

impl DbInner {
    #[inline]
    pub(crate) fn less(&self, a: &[u8], b: &[u8]) -> bool {
        (self.comparator)(a, b) == std::cmp::Ordering::Less
    }

    #[inline]
    pub(crate) fn keys_equal(&self, a: &[u8], b: &[u8]) -> bool {
        (self.comparator)(a, b) == std::cmp::Ordering::Equal
    }

    /// Index of the first key >= `key` under the comparator.
    pub(crate) fn lower_bound(&self, keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|k| self.less(k, key))
    }

    /// Cache-backed node resolution. The root never resolves through here;
    /// descents start from the pinned root slot.
    pub(crate) fn node(&self, id: PageId) -> Result<NodeRef> {
        self.cache.to_node(&self.pager, id)
    }

    /// Whether `node` could overflow if the incoming entry landed in it.
    /// The interior cost uses the worst-case key length because the key
    /// actually promoted by a deeper split is unknown here.
    fn is_full(&self, node: &Node, key: &[u8], value: &ValueRecord) -> bool {
        let mut used = node.page_used;
        if node.leaf {
            used += KEY_LEN_FIELD + key.len();
            used += VALUE_LEN_FIELD + TRX_ID_FIELD + value.inline_len(self.over_value);
        } else {
            used += KEY_LEN_FIELD + MAX_KEY_LEN + PAGE_ID_SIZE;
        }
        used > self.page_size
    }

    fn split_type(&self, node: &Node, key: &[u8]) -> SplitType {
        if node.leaf {
            if node.next_leaf == 0 && node.keys.last().is_some_and(|last| self.less(last, key)) {
                return SplitType::RightInsert;
            }
            if node.prev_leaf == 0 && node.keys.first().is_some_and(|first| self.less(key, first))
            {
                return SplitType::LeftInsert;
            }
        }
        SplitType::Mid
    }

    /// Splits the full child at `pg.children[i]` underneath its latched
    /// parent, inserting the promoted separator and the new sibling.
    fn split_child(
        &self,
        pc: &NodeRef,
        pg: &mut NodeWriteGuard,
        i: usize,
        key: &[u8],
        yc: &NodeRef,
        yg: &mut NodeWriteGuard,
    ) -> Result<()> {
        let split = self.split_type(yg, key);
        let z_id = self.pager.alloc_page()?;

        let mut zn = Node::new(yg.leaf);
        if split == SplitType::Mid {
            let point = yg.keys.len().div_ceil(2);
            zn.keys = yg.keys.split_off(point);
            if yg.leaf {
                zn.values = yg.values.split_off(point);
            } else {
                zn.children = yg.children.split_off(point);
            }
            yg.refresh(self.over_value);
        }
        zn.refresh(self.over_value);
        let z_last = zn.keys.last().cloned();
        let zc = NodeCell::new(z_id, zn);
        zc.mark_dirty();
        yc.mark_dirty();
        self.cache.insert(z_id, zc.clone());

        let promoted = match split {
            SplitType::LeftInsert => key.to_vec(),
            _ => yg
                .keys
                .last()
                .cloned()
                .expect("split of an empty node"),
        };
        pg.keys.insert(i, promoted);
        pg.children.insert(i + 1, z_id);
        if split == SplitType::LeftInsert {
            pg.children.swap(i, i + 1);
        }
        if pg.keys.len() == 2 {
            // A freshly grown root carried a placeholder upper bound.
            pg.keys[1] = match split {
                SplitType::Mid => z_last.expect("mid split produced an empty sibling"),
                SplitType::RightInsert => key.to_vec(),
                SplitType::LeftInsert => {
                    yg.keys.last().cloned().expect("split of an empty node")
                }
            };
        }
        pg.refresh(self.over_value);
        pc.mark_dirty();

        if yg.leaf {
            self.link_leaf(&zc, yc, yg, split)?;
        }
        Ok(())
    }

    /// Splices the new leaf into the doubly-linked chain, latching the
    /// affected neighbor exclusively.
    fn link_leaf(
        &self,
        zc: &NodeRef,
        yc: &NodeRef,
        yg: &mut NodeWriteGuard,
        split: SplitType,
    ) -> Result<()> {
        let mut zg = zc.write();
        if split == SplitType::LeftInsert {
            // [z y]
            zg.next_leaf = yc.id;
            zg.prev_leaf = yg.prev_leaf;
            if yg.prev_leaf != 0 {
                let neighbor = self.node(yg.prev_leaf)?;
                neighbor.write().next_leaf = zc.id;
                neighbor.mark_dirty();
            }
            yg.prev_leaf = zc.id;
        } else {
            // [y z]
            zg.prev_leaf = yc.id;
            zg.next_leaf = yg.next_leaf;
            if yg.next_leaf != 0 {
                let neighbor = self.node(yg.next_leaf)?;
                neighbor.write().prev_leaf = zc.id;
                neighbor.mark_dirty();
            }
            yg.next_leaf = zc.id;
        }
        Ok(())
    }

    pub(crate) fn tree_insert(&self, key: &[u8], value: ValueRecord) -> Result<()> {
        let mut slot = self.root.write();
        let mut cur: NodeRef = slot.clone();
        let mut g = cur.write();

        if self.is_full(&g, key, &value) {
            // Grow the tree: a new interior root adopts the old root as its
            // only child, then splits it. The old root keeps its page; the
            // new root takes a fresh one.
            let new_root_id = self.pager.alloc_page()?;
            let old_id = cur.id;
            let mut root_node = Node::new(false);
            root_node.keys.push(Vec::new()); // placeholder, fixed by the split
            root_node.children.push(old_id);
            root_node.refresh(self.over_value);
            let new_root = NodeCell::new(new_root_id, root_node);
            new_root.mark_dirty();
            cur.mark_dirty();
            self.cache.insert(old_id, cur.clone());
            self.pager.header().set_root_id(new_root_id);

            let mut ng = new_root.write();
            self.split_child(&new_root, &mut ng, 0, key, &cur, &mut g)?;
            drop(g);
            *slot = new_root.clone();
            cur = new_root;
            g = ng;
        }

        loop {
            let mut i = self.lower_bound(&g.keys, key);
            if g.leaf {
                if i < g.keys.len() && self.keys_equal(&g.keys[i], key) {
                    let old = std::mem::replace(&mut g.values[i], value);
                    self.cache.free_value(&self.pager, &self.overflow, &old)?;
                } else {
                    g.keys.insert(i, key.to_vec());
                    g.values.insert(i, value);
                    let mut h = self.pager.header();
                    let new_key_nums = h.key_nums() + 1;
                    h.set_key_nums(new_key_nums);
                    if i == 0 && g.prev_leaf == 0 {
                        h.set_leaf_id(cur.id);
                    }
                }
                g.refresh(self.over_value);
                cur.mark_dirty();
                return Ok(());
            }

            if i == g.keys.len() {
                // Key beyond every separator: stretch the last upper bound.
                i -= 1;
                g.keys[i] = key.to_vec();
                g.refresh(self.over_value);
                cur.mark_dirty();
            }

            let child = self.node(g.children[i])?;
            let cg = child.write();
            if self.is_full(&cg, key, &value) {
                let mut cg = cg;
                self.split_child(&cur, &mut g, i, key, &child, &mut cg)?;
                if self.less(&g.keys[i], key) {
                    i += 1;
                }
                let target = g.children[i];
                if target == child.id {
                    drop(g);
                    cur = child;
                    g = cg;
                } else {
                    drop(cg);
                    let sibling = self.node(target)?;
                    let sg = sibling.write();
                    drop(g);
                    cur = sibling;
                    g = sg;
                }
            } else {
                drop(g);
                cur = child;
                g = cg;
            }
        }
    }

    /// Removes `key`, rebalancing on the way down. Returns whether the key
    /// existed.
    pub(crate) fn tree_erase(&self, key: &[u8]) -> Result<bool> {
        let mut slot = self.root.write();
        let mut cur: NodeRef = slot.clone();
        let mut g = cur.write();
        // The predecessor leaf of a separator hit, latched for the rest of
        // the descent.
        let mut precursor: Option<(NodeRef, NodeWriteGuard)> = None;
        let removed;

        loop {
            let n = g.keys.len();
            let i = self.lower_bound(&g.keys, key);
            if g.leaf {
                if i < n && self.keys_equal(&g.keys[i], key) {
                    g.keys.remove(i);
                    let old = g.values.remove(i);
                    self.cache.free_value(&self.pager, &self.overflow, &old)?;
                    g.refresh(self.over_value);
                    cur.mark_dirty();
                    let mut h = self.pager.header();
                    let new_key_nums = h.key_nums() - 1;
                    h.set_key_nums(new_key_nums);
                    removed = true;
                } else {
                    removed = false;
                }
                break;
            }
            if i == n {
                removed = false;
                break;
            }

            let child = self.node(g.children[i])?;
            let reuse_precursor = precursor
                .as_ref()
                .is_some_and(|(p, _)| NodeRef::ptr_eq(p, &child));
            let mut cg = if reuse_precursor {
                precursor.take().unwrap().1
            } else {
                child.write()
            };

            // A separator equal to the deleted key must be replaced by the
            // new subtree maximum, read from the predecessor leaf.
            let mut fix = None;
            if precursor.is_none() && i < n && self.keys_equal(&g.keys[i], key) {
                if cg.leaf {
                    ensure!(
                        cg.keys.len() >= 2,
                        "predecessor leaf too small for separator replacement"
                    );
                    fix = Some(cg.keys[cg.keys.len() - 2].clone());
                } else {
                    let (pc, pguard) = self.find_precursor(&cg)?;
                    ensure!(
                        pguard.keys.len() >= 2,
                        "predecessor leaf too small for separator replacement"
                    );
                    fix = Some(pguard.keys[pguard.keys.len() - 2].clone());
                    precursor = Some((pc, pguard));
                }
            } else if let Some((_, pguard)) = &precursor {
                fix = Some(pguard.keys[pguard.keys.len() - 2].clone());
            }
            if let Some(replacement) = fix {
                g.keys[i] = replacement;
                g.refresh(self.over_value);
                cur.mark_dirty();
            }

            let half = self.page_size / 2;
            if cg.page_used >= half {
                drop(g);
                cur = child;
                g = cg;
                continue;
            }

            // Underfull child: borrow from a sibling that can spare an
            // entry, otherwise merge (left preferred).
            let left = if i > 0 {
                Some(self.node(g.children[i - 1])?)
            } else {
                None
            };
            let right = if i + 1 < g.keys.len() {
                Some(self.node(g.children[i + 1])?)
            } else {
                None
            };
            let mut left_g = left.as_ref().map(|c| c.write());
            let mut right_g = right.as_ref().map(|c| c.write());

            if left_g.as_ref().is_some_and(|y| y.page_used >= half) {
                let yc = left.as_ref().unwrap();
                let yg = left_g.as_mut().unwrap();
                self.borrow_from_left(&cur, &mut g, i, &child, &mut cg, yc, yg);
                drop(left_g);
                drop(right_g);
                drop(g);
                cur = child;
                g = cg;
            } else if right_g.as_ref().is_some_and(|z| z.page_used >= half) {
                let zc = right.as_ref().unwrap();
                let zg = right_g.as_mut().unwrap();
                self.borrow_from_right(&cur, &mut g, i, &child, &mut cg, zc, zg);
                drop(left_g);
                drop(right_g);
                drop(g);
                cur = child;
                g = cg;
            } else if let Some(yc) = left {
                let mut yg = left_g.take().unwrap();
                drop(right_g);
                let keep = g.children[i - 1];
                g.keys.remove(i - 1);
                g.children.remove(i - 1);
                g.children[i - 1] = keep;
                g.refresh(self.over_value);
                cur.mark_dirty();
                self.merge_into(&yc, &mut yg, &child, &mut cg)?;
                drop(cg);
                drop(g);
                cur = yc;
                g = yg;
            } else if let Some(zc) = right {
                let mut zg = right_g.take().unwrap();
                drop(left_g);
                let keep = g.children[i];
                g.keys.remove(i);
                g.children.remove(i);
                g.children[i] = keep;
                g.refresh(self.over_value);
                cur.mark_dirty();
                self.merge_into(&child, &mut cg, &zc, &mut zg)?;
                drop(zg);
                drop(g);
                cur = child;
                g = cg;
            } else {
                bail!("interior node with a single child during erase");
            }
        }

        drop(g);
        drop(precursor);

        // An interior root left with one child hands its role down.
        let collapse = {
            let rg = slot.read();
            if !rg.leaf && rg.keys.len() == 1 {
                Some(rg.children[0])
            } else {
                None
            }
        };
        if let Some(child_id) = collapse {
            let child = self.node(child_id)?;
            self.cache.remove(child_id);
            let old_id = slot.id;
            self.pager.free_page(old_id)?;
            self.pager.header().set_root_id(child_id);
            *slot = child;
        }
        Ok(removed)
    }

    /// Walks to the rightmost leaf below an interior node, crabbing
    /// exclusive latches, and returns it latched.
    fn find_precursor(&self, start: &Node) -> Result<(NodeRef, NodeWriteGuard)> {
        let first = *start
            .children
            .last()
            .expect("interior node without children");
        let mut cur = self.node(first)?;
        let mut g = cur.write();
        loop {
            if g.leaf {
                return Ok((cur, g));
            }
            let next_id = *g.children.last().expect("interior node without children");
            let next = self.node(next_id)?;
            let ng = next.write();
            drop(g);
            cur = next;
            g = ng;
        }
    }

    /// Rotates the left sibling's greatest entry into the child through the
    /// parent separator at `i - 1`.
    #[allow(clippy::too_many_arguments)]
    fn borrow_from_left(
        &self,
        pc: &NodeRef,
        pg: &mut NodeWriteGuard,
        i: usize,
        xc: &NodeRef,
        xg: &mut NodeWriteGuard,
        yc: &NodeRef,
        yg: &mut NodeWriteGuard,
    ) {
        let key = yg.keys.pop().expect("borrow from an empty sibling");
        xg.keys.insert(0, key);
        if xg.leaf {
            let value = yg.values.pop().expect("leaf keys/values out of step");
            xg.values.insert(0, value);
        } else {
            let child = yg.children.pop().expect("interior keys/children out of step");
            xg.children.insert(0, child);
        }
        pg.keys[i - 1] = yg
            .keys
            .last()
            .cloned()
            .expect("sibling drained by borrow");
        yg.refresh(self.over_value);
        xg.refresh(self.over_value);
        pg.refresh(self.over_value);
        yc.mark_dirty();
        xc.mark_dirty();
        pc.mark_dirty();
    }

    /// Rotates the right sibling's least entry into the child; the parent
    /// separator at `i` becomes that entry's key.
    #[allow(clippy::too_many_arguments)]
    fn borrow_from_right(
        &self,
        pc: &NodeRef,
        pg: &mut NodeWriteGuard,
        i: usize,
        xc: &NodeRef,
        xg: &mut NodeWriteGuard,
        zc: &NodeRef,
        zg: &mut NodeWriteGuard,
    ) {
        pg.keys[i] = zg.keys[0].clone();
        xg.keys.push(zg.keys.remove(0));
        if xg.leaf {
            xg.values.push(zg.values.remove(0));
        } else {
            xg.children.push(zg.children.remove(0));
        }
        zg.refresh(self.over_value);
        xg.refresh(self.over_value);
        pg.refresh(self.over_value);
        zc.mark_dirty();
        xc.mark_dirty();
        pc.mark_dirty();
    }

    /// Absorbs `src` into `dst` (its left neighbor at the same level) and
    /// frees `src`'s page.
    fn merge_into(
        &self,
        dst_c: &NodeRef,
        dst_g: &mut NodeWriteGuard,
        src_c: &NodeRef,
        src_g: &mut NodeWriteGuard,
    ) -> Result<()> {
        dst_g.keys.append(&mut src_g.keys);
        if dst_g.leaf {
            dst_g.values.append(&mut src_g.values);
            dst_g.next_leaf = src_g.next_leaf;
            if src_g.next_leaf != 0 {
                let neighbor = self.node(src_g.next_leaf)?;
                neighbor.write().prev_leaf = dst_c.id;
                neighbor.mark_dirty();
            }
            let mut h = self.pager.header();
            if h.leaf_id() == src_c.id {
                h.set_leaf_id(dst_c.id);
            }
        } else {
            dst_g.children.append(&mut src_g.children);
        }
        dst_g.refresh(self.over_value);
        dst_c.mark_dirty();

        src_c.mark_deleted();
        self.cache.remove(src_c.id);
        self.pager.free_page(src_c.id)
    }

    /// Point lookup of the live record: full value bytes plus the xid that
    /// wrote them. The value is materialized while the leaf latch is still
    /// held so a concurrent delete cannot free its overflow chain mid-walk.
    pub(crate) fn read_current(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>> {
        let slot = self.root.read();
        let cur: NodeRef = slot.clone();
        let mut g = cur.read();
        drop(slot);
        loop {
            let i = self.lower_bound(&g.keys, key);
            if g.leaf {
                if i < g.keys.len() && self.keys_equal(&g.keys[i], key) {
                    let record = &g.values[i];
                    let value = self.cache.load_real_value(&self.pager, record)?;
                    return Ok(Some((value, record.trx_id)));
                }
                return Ok(None);
            }
            if i == g.keys.len() {
                return Ok(None);
            }
            let child = self.node(g.children[i])?;
            let cg = child.read();
            drop(g);
            g = cg;
        }
    }

    /// Exact-match position of a key, for iterator seeks. The caller holds
    /// the shared root latch and passes the pinned root in.
    pub(crate) fn find_exact(
        &self,
        root: &NodeRef,
        key: &[u8],
    ) -> Result<Option<(PageId, usize)>> {
        let mut cur = root.clone();
        let mut g = cur.read();
        loop {
            let i = self.lower_bound(&g.keys, key);
            if g.leaf {
                if i < g.keys.len() && self.keys_equal(&g.keys[i], key) {
                    let id = cur.id;
                    return Ok(Some((id, i)));
                }
                return Ok(None);
            }
            if i == g.keys.len() {
                return Ok(None);
            }
            let child = self.node(g.children[i])?;
            let cg = child.read();
            drop(g);
            cur = child;
            g = cg;
        }
    }

    /// Position of the greatest key, for `seek_last`.
    pub(crate) fn last_position(&self, root: &NodeRef) -> Result<Option<(PageId, usize)>> {
        let mut cur = root.clone();
        let mut g = cur.read();
        loop {
            if g.leaf {
                if g.keys.is_empty() {
                    return Ok(None);
                }
                let id = cur.id;
                let at = g.keys.len() - 1;
                return Ok(Some((id, at)));
            }
            let child_id = *g.children.last().expect("interior node without children");
            let child = self.node(child_id)?;
            let cg = child.read();
            drop(g);
            cur = child;
            g = cg;
        }
    }
}
