//! # Configuration
//!
//! Open-time options and the engine constants they interact with. The page
//! size is baked into the data file at creation; reopening an existing
//! database ignores the configured `page_size` in favor of the on-disk one.
//!
//! ## Constant Relationships
//!
//! ```text
//! page_size (4K..64K)
//!       │
//!       ├─> overflow threshold  = page_size / 16
//!       │     values longer than this split into a leaf prefix + overflow
//!       │     pages; the leaf-resident prefix is (threshold - 10) bytes
//!       │
//!       ├─> full overflow page capacity   = page_size - 8
//!       └─> shared overflow page capacity = page_size - 12
//!
//! page_cache_slots (>= 128)
//!       └─> LRU capacity of the node cache; dirty nodes are pinned and do
//!           not count against eviction candidates
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::error::DbError;

/// Allowed page sizes, in bytes.
pub const VALID_PAGE_SIZES: [usize; 5] = [
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
];

pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Minimum node-cache capacity; smaller configured values are clamped up.
pub const MIN_PAGE_CACHE_SLOTS: usize = 128;
pub const DEFAULT_PAGE_CACHE_SLOTS: usize = 1024;

/// Maximum key length in bytes. Small keys keep the branching factor of
/// interior nodes high.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: u64 = u32::MAX as u64;

/// Stripes in the transactional key-lock table.
pub const LOCK_STRIPES: usize = 16;

/// Stripes in the MVCC version store.
pub const VERSION_STRIPES: usize = 64;

/// Version-store memory level that triggers an asynchronous purge.
pub const VERSION_MEMORY_THRESHOLD: usize = 16 * 1024 * 1024;

/// Total order over keys. Must be a strict total order; the default is
/// byte-wise lexicographic comparison.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Options recognized by [`crate::Db::open`].
#[derive(Clone)]
pub struct Options {
    /// Fixed page size; one of 4K, 8K, 16K, 32K or 64K.
    pub page_size: usize,
    /// Node-cache capacity, clamped to at least [`MIN_PAGE_CACHE_SLOTS`].
    pub page_cache_slots: usize,
    /// 0 = fsync the WAL after every record, 1 = buffered fsync.
    pub wal_sync: u8,
    /// Buffered mode: byte level of the in-memory WAL buffer that wakes the
    /// sync thread.
    pub wal_sync_buffer_size: usize,
    /// Seconds between forced wake-ups of the WAL sync thread.
    pub wal_wake_interval: u64,
    /// Seconds between scheduled checkpoints.
    pub check_point_interval: u64,
    /// Key comparator; lexicographic when absent.
    pub keycomp: Option<KeyComparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_cache_slots: DEFAULT_PAGE_CACHE_SLOTS,
            wal_sync: 1,
            wal_sync_buffer_size: 4096,
            wal_wake_interval: 1,
            check_point_interval: 10,
            keycomp: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("page_size", &self.page_size)
            .field("page_cache_slots", &self.page_cache_slots)
            .field("wal_sync", &self.wal_sync)
            .field("wal_sync_buffer_size", &self.wal_sync_buffer_size)
            .field("wal_wake_interval", &self.wal_wake_interval)
            .field("check_point_interval", &self.check_point_interval)
            .field("keycomp", &self.keycomp.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if !VALID_PAGE_SIZES.contains(&self.page_size) {
            return Err(DbError::BadConfig(format!(
                "page_size must be one of 4K, 8K, 16K, 32K or 64K, got {}",
                self.page_size
            ))
            .into());
        }
        if self.wal_sync > 1 {
            return Err(DbError::BadConfig(format!(
                "wal_sync must be 0 (per-record) or 1 (buffered), got {}",
                self.wal_sync
            ))
            .into());
        }
        Ok(())
    }

    pub fn comparator(&self) -> KeyComparator {
        match &self.keycomp {
            Some(c) => Arc::clone(c),
            None => Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
        }
    }

    pub fn cache_slots(&self) -> usize {
        self.page_cache_slots.max(MIN_PAGE_CACHE_SLOTS)
    }
}

/// Values longer than this threshold spill into overflow pages.
pub fn overflow_threshold(page_size: usize) -> usize {
    page_size / 16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;

    #[test]
    fn default_options_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn bad_page_size_is_rejected() {
        let opts = Options {
            page_size: 5000,
            ..Options::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(matches!(error_kind(&err), Some(DbError::BadConfig(_))));
    }

    #[test]
    fn bad_wal_sync_is_rejected() {
        let opts = Options {
            wal_sync: 2,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn cache_slots_are_clamped() {
        let opts = Options {
            page_cache_slots: 4,
            ..Options::default()
        };
        assert_eq!(opts.cache_slots(), MIN_PAGE_CACHE_SLOTS);
    }

    #[test]
    fn default_comparator_is_lexicographic() {
        let cmp = Options::default().comparator();
        assert_eq!(cmp(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp(b"b", b"a"), Ordering::Greater);
        assert_eq!(cmp(b"ab", b"ab"), Ordering::Equal);
        assert_eq!(cmp(b"a", b"ab"), Ordering::Less);
    }

    #[test]
    fn overflow_threshold_tracks_page_size() {
        assert_eq!(overflow_threshold(4096), 256);
        assert_eq!(overflow_threshold(16384), 1024);
        assert_eq!(overflow_threshold(65536), 4096);
    }
}
