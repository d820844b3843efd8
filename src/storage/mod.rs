//! # Storage Layer
//!
//! The foundational on-disk layer: a single data file of fixed-size pages
//! addressed by their byte offset, an intrusive free-page list, a pool of
//! shared overflow pages for large-value tails, a redo WAL, and the node
//! cache (translation table) that maps page ids to in-memory B+tree nodes.
//!
//! ## Data File Layout
//!
//! ```text
//! dump.db
//! ├── offset 0:            header (65 bytes, packed little-endian)
//! ├── offset page_size:    first page
//! ├── offset page_size*2:  second page
//! └── ...
//! ```
//!
//! A page id *is* its byte offset, so id 0 is never a valid page (the header
//! lives there) and doubles as the null page id throughout the engine.
//!
//! ## Page Roles
//!
//! A page holds exactly one of:
//!
//! - a serialized B+tree node (leaf or interior),
//! - the tail of one large value ("full" overflow page),
//! - tails of several small values ("shared" overflow page, free-block list
//!   inside the payload),
//! - a link in the free-page stack (first 8 bytes = next free page id).
//!
//! ## Latch Order
//!
//! The header latch is acquired before the overflow allocator latch when an
//! operation needs both; the reverse order is forbidden. Both are leaves of
//! the broader hierarchy (root latch -> node latches -> header/allocator).

mod cache;
mod header;
mod overflow;
mod pager;
pub mod wal;

pub use cache::NodeCache;
pub use header::{DbHeader, DB_HEADER_SIZE, MAGIC};
pub use overflow::OverflowAllocator;
pub use pager::Pager;
pub use wal::{Logger, WalRecord, OP_DELETE, OP_INSERT, OP_UPDATE};

/// Page ids are byte offsets into the data file.
pub type PageId = u64;

pub const PAGE_ID_SIZE: usize = 8;

// Serialized field widths shared by the node codec and the fullness math.
pub const TYPE_FIELD: usize = 1;
pub const KEY_COUNT_FIELD: usize = 2;
pub const KEY_LEN_FIELD: usize = 1;
pub const VALUE_LEN_FIELD: usize = 4;
pub const TRX_ID_FIELD: usize = 8;

/// Shared overflow page header: next page id (8) + avail (2) + free head (2).
pub const OVER_PAGE_HEADER: usize = PAGE_ID_SIZE + 2 + 2;

/// Usable payload of a full overflow page (everything after the next link).
pub fn full_overflow_capacity(page_size: usize) -> usize {
    page_size - PAGE_ID_SIZE
}

/// Usable payload of a shared overflow page.
pub fn shared_overflow_capacity(page_size: usize) -> usize {
    page_size - OVER_PAGE_HEADER
}

/// Length of the leaf-resident prefix kept for an overflowed value: the
/// inline allowance minus the (over_page_id, page_off) back-reference.
pub fn overflow_prefix_len(threshold: usize) -> usize {
    threshold - PAGE_ID_SIZE - 2
}

/// Free blocks inside a shared overflow page are rounded up to 4 bytes, the
/// size of one (next_free_offset, size) cell.
pub fn round4(n: u16) -> u16 {
    (n + 3) & !3
}
