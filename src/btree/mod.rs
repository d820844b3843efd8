//! # B+Tree
//!
//! Node layout plus the latch-crabbing tree algorithms.
//!
//! ## Shape
//!
//! - All data lives in leaves; interior nodes hold separator keys and child
//!   page ids. `keys[i]` is the *exact greatest key* of `children[i]`'s
//!   subtree, so `|keys| == |children|` and the rightmost separator equals
//!   the subtree maximum.
//! - Leaves form a doubly-linked chain in key order for range scans.
//! - Fullness is measured in serialized bytes, not entry counts: a node is
//!   split (or merged) based on `page_used` against the page size.
//!
//! ## Latching
//!
//! Top-down crabbing (Bayer-Schkolnick): writers descend with preemptive
//! splits/merges so a child latch can always replace its parent's; readers
//! hold at most two shared latches at a time. Writers additionally hold the
//! exclusive root latch for the whole mutation, which is what lets an
//! iterator pin the tree shape with a shared root latch alone.

pub mod node;
pub mod tree;

pub use node::{Node, NodeCell, NodeReadGuard, NodeRef, NodeWriteGuard, ValueRecord};
