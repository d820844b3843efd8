//! # Version Store
//!
//! Per-key chains of prior values for snapshot reads. When a writer
//! replaces or deletes a key, the *previous* record (value bytes plus the
//! xid that wrote them) is pushed at the front of the key's chain; readers
//! whose view cannot see the live tree record walk the chain newest-first
//! for the most recent visible version.
//!
//! ## Sharding & Memory
//!
//! 64 stripes by key hash, each an `RwLock`ed map. Stored bytes are tallied
//! atomically; crossing the 16 MiB threshold spawns one asynchronous purge
//! pass that, under each stripe's write lock, drops versions nobody
//! references anymore. References are `Arc` strong counts: a reader's
//! transaction keeps the versions it resolved alive until it finishes, so
//! "refcount zero" is exactly "only the store still holds the Arc".

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::{VERSION_MEMORY_THRESHOLD, VERSION_STRIPES};

use super::transaction::ReadView;

/// Fixed bookkeeping cost charged per record on top of the payload bytes.
const RECORD_OVERHEAD: usize = 64;

#[derive(Debug)]
pub struct VersionRecord {
    pub trx_id: u64,
    pub value: Vec<u8>,
}

type Chain = SmallVec<[Arc<VersionRecord>; 2]>;

struct Stripe {
    keys: RwLock<HashMap<Vec<u8>, Chain>>,
}

struct Inner {
    stripes: Vec<Stripe>,
    memory: AtomicUsize,
    purging: AtomicBool,
}

pub struct VersionStore {
    inner: Arc<Inner>,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stripes: (0..VERSION_STRIPES)
                    .map(|_| Stripe {
                        keys: RwLock::new(HashMap::new()),
                    })
                    .collect(),
                memory: AtomicUsize::new(0),
                purging: AtomicBool::new(false),
            }),
        }
    }

    fn stripe<'a>(inner: &'a Inner, key: &[u8]) -> &'a Stripe {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &inner.stripes[(hasher.finish() as usize) % VERSION_STRIPES]
    }

    /// Records the pre-write image of a key: `trx_id` is the xid that wrote
    /// the value being replaced, so visibility checks against it behave
    /// exactly as they would have against the old tree record.
    pub fn add(&self, key: &[u8], value: Vec<u8>, trx_id: u64) {
        let inner = &*self.inner;
        let cost = RECORD_OVERHEAD + key.len() + value.len();
        {
            let stripe = Self::stripe(inner, key);
            let mut keys = stripe.keys.write();
            let chain = keys.entry_ref(key).or_default();
            chain.insert(0, Arc::new(VersionRecord { trx_id, value }));
        }
        let total = inner.memory.fetch_add(cost, Ordering::Relaxed) + cost;

        if total >= VERSION_MEMORY_THRESHOLD
            && !inner.purging.swap(true, Ordering::AcqRel)
        {
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("burrowdb-version-purge".into())
                .spawn(move || purge(&inner))
                .ok();
        }
    }

    /// Newest version visible under `view`, if any. The caller must retain
    /// the returned `Arc` until its transaction ends so the purge pass
    /// keeps the record.
    pub fn visible(&self, key: &[u8], view: &ReadView) -> Option<Arc<VersionRecord>> {
        let stripe = Self::stripe(&self.inner, key);
        let keys = stripe.keys.read();
        let chain = keys.get(key)?;
        chain
            .iter()
            .find(|record| view.is_visible(record.trx_id))
            .cloned()
    }

    pub fn memory_used(&self) -> usize {
        self.inner.memory.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn purge_now(&self) {
        purge(&self.inner);
    }
}

fn purge(inner: &Inner) {
    let mut dropped = 0usize;
    for stripe in &inner.stripes {
        let mut keys = stripe.keys.write();
        keys.retain(|key, chain| {
            chain.retain(|record| {
                if Arc::strong_count(record) > 1 {
                    return true;
                }
                let cost = RECORD_OVERHEAD + key.len() + record.value.len();
                inner.memory.fetch_sub(cost, Ordering::Relaxed);
                dropped += 1;
                false
            });
            !chain.is_empty()
        });
    }
    inner.purging.store(false, Ordering::Release);
    debug!(dropped, "version-store purge finished");
}
