//! # Database File Header
//!
//! The header occupies the first 65 bytes of `dump.db` and is the root of
//! trust for everything else: it locates the tree root, the leftmost leaf,
//! the free-page stack and the shared overflow-page list.
//!
//! ## Layout (packed, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------
//! 0       1     magic (0x1a)
//! 1       8     page_size
//! 9       8     key_nums
//! 17      8     root_id
//! 25      8     leaf_id             leftmost leaf
//! 33      8     free_list_head
//! 41      8     free_pages
//! 49      8     over_page_list_head
//! 57      8     over_pages
//! ```
//!
//! The struct is a `zerocopy` view so the header round-trips to disk without
//! a hand-written codec; all multi-byte fields are `U64<LittleEndian>` and
//! the layout is unaligned-safe for reads out of arbitrary buffers.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::VALID_PAGE_SIZES;
use crate::error::DbError;

use super::PageId;

pub const MAGIC: u8 = 0x1a;
pub const DB_HEADER_SIZE: usize = 65;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbHeader {
    magic: u8,
    page_size: U64,
    key_nums: U64,
    root_id: U64,
    leaf_id: U64,
    free_list_head: U64,
    free_pages: U64,
    over_page_list_head: U64,
    over_pages: U64,
}

const _: () = assert!(std::mem::size_of::<DbHeader>() == DB_HEADER_SIZE);

impl DbHeader {
    pub fn new(page_size: usize) -> Self {
        Self {
            magic: MAGIC,
            page_size: U64::new(page_size as u64),
            key_nums: U64::new(0),
            root_id: U64::new(0),
            leaf_id: U64::new(0),
            // Offset 0 holds the header itself; the first allocatable page
            // starts one page in.
            free_list_head: U64::new(page_size as u64),
            free_pages: U64::new(0),
            over_page_list_head: U64::new(0),
            over_pages: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            DbError::BadFile(format!(
                "data file too short for header: {} < {}",
                bytes.len(),
                DB_HEADER_SIZE
            ))
        );
        let header = Self::read_from_bytes(&bytes[..DB_HEADER_SIZE])
            .map_err(|e| DbError::BadFile(format!("unreadable header: {e:?}")))?;
        ensure!(
            header.magic == MAGIC,
            DbError::BadFile(format!(
                "bad magic byte {:#04x}, expected {:#04x}",
                header.magic, MAGIC
            ))
        );
        ensure!(
            VALID_PAGE_SIZES.contains(&(header.page_size.get() as usize)),
            DbError::BadFile(format!(
                "header carries invalid page size {}",
                header.page_size.get()
            ))
        );
        Ok(header)
    }

    pub fn page_size(&self) -> usize {
        self.page_size.get() as usize
    }

    pub fn key_nums(&self) -> u64 {
        self.key_nums.get()
    }

    pub fn set_key_nums(&mut self, n: u64) {
        self.key_nums = U64::new(n);
    }

    pub fn root_id(&self) -> PageId {
        self.root_id.get()
    }

    pub fn set_root_id(&mut self, id: PageId) {
        self.root_id = U64::new(id);
    }

    pub fn leaf_id(&self) -> PageId {
        self.leaf_id.get()
    }

    pub fn set_leaf_id(&mut self, id: PageId) {
        self.leaf_id = U64::new(id);
    }

    pub fn free_list_head(&self) -> PageId {
        self.free_list_head.get()
    }

    pub fn set_free_list_head(&mut self, id: PageId) {
        self.free_list_head = U64::new(id);
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages.get()
    }

    pub fn set_free_pages(&mut self, n: u64) {
        self.free_pages = U64::new(n);
    }

    pub fn over_page_list_head(&self) -> PageId {
        self.over_page_list_head.get()
    }

    pub fn set_over_page_list_head(&mut self, id: PageId) {
        self.over_page_list_head = U64::new(id);
    }

    pub fn over_pages(&self) -> u64 {
        self.over_pages.get()
    }

    pub fn set_over_pages(&mut self, n: u64) {
        self.over_pages = U64::new(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn header_is_65_bytes() {
        assert_eq!(std::mem::size_of::<DbHeader>(), 65);
    }

    #[test]
    fn new_header_starts_allocating_after_itself() {
        let h = DbHeader::new(4096);
        assert_eq!(h.free_list_head(), 4096);
        assert_eq!(h.free_pages(), 0);
        assert_eq!(h.root_id(), 0);
        assert_eq!(h.key_nums(), 0);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let mut h = DbHeader::new(16384);
        h.set_key_nums(42);
        h.set_root_id(16384);
        h.set_leaf_id(32768);
        h.set_free_pages(3);

        let decoded = DbHeader::from_bytes(h.as_bytes()).unwrap();
        assert_eq!(decoded.key_nums(), 42);
        assert_eq!(decoded.root_id(), 16384);
        assert_eq!(decoded.leaf_id(), 32768);
        assert_eq!(decoded.free_pages(), 3);
        assert_eq!(decoded.page_size(), 16384);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut h = DbHeader::new(4096);
        h.magic = 0x00;
        let err = DbHeader::from_bytes(h.as_bytes()).unwrap_err();
        assert!(matches!(
            crate::error::error_kind(&err),
            Some(DbError::BadFile(_))
        ));
    }

    #[test]
    fn invalid_page_size_on_disk_is_rejected() {
        let mut h = DbHeader::new(4096);
        h.page_size = U64::new(1234);
        assert!(DbHeader::from_bytes(h.as_bytes()).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(DbHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
