//! # Striped Key Locks
//!
//! Transaction-scoped shared/exclusive locks at key granularity, striped 16
//! ways by key hash. Each stripe is a mutex-protected map plus one condvar;
//! conflicting requesters block on the condvar and are woken when a holder
//! releases.
//!
//! A transaction that is the sole holder of a key re-enters idempotently
//! and may switch the mode in place (shared -> exclusive upgrade).
//!
//! Deadlock between transactions locking multiple keys in opposite orders
//! is possible by design and neither detected nor prevented.

use std::hash::{Hash, Hasher};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::config::LOCK_STRIPES;

#[derive(Default)]
struct LockInfo {
    exclusive: bool,
    waiters: u32,
    owners: SmallVec<[u64; 2]>,
}

struct LockStripe {
    map: Mutex<HashMap<Vec<u8>, LockInfo>>,
    cv: Condvar,
}

pub struct KeyLockManager {
    stripes: Vec<LockStripe>,
}

impl Default for KeyLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES)
                .map(|_| LockStripe {
                    map: Mutex::new(HashMap::new()),
                    cv: Condvar::new(),
                })
                .collect(),
        }
    }

    fn stripe(&self, key: &[u8]) -> &LockStripe {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    /// Acquires the key in the requested mode, blocking while another
    /// transaction holds a conflicting mode.
    pub fn lock(&self, xid: u64, key: &[u8], exclusive: bool) {
        let stripe = self.stripe(key);
        let mut map = stripe.map.lock();

        match map.get_mut(key) {
            None => {
                let mut info = LockInfo {
                    exclusive,
                    ..Default::default()
                };
                info.owners.push(xid);
                map.insert(key.to_vec(), info);
            }
            Some(info) => {
                if info.owners.len() == 1 && info.owners[0] == xid {
                    // Sole holder: re-enter, possibly upgrading.
                    info.exclusive = exclusive;
                    return;
                }
                if exclusive || info.exclusive {
                    info.waiters += 1;
                    loop {
                        let held = map.get(key).is_some_and(|i| !i.owners.is_empty());
                        if !held {
                            break;
                        }
                        stripe.cv.wait(&mut map);
                    }
                    let info = map.entry(key.to_vec()).or_default();
                    info.exclusive = exclusive;
                    info.owners.push(xid);
                    info.waiters = info.waiters.saturating_sub(1);
                } else {
                    info.owners.push(xid);
                }
            }
        }
    }

    pub fn unlock(&self, xid: u64, key: &[u8]) {
        let stripe = self.stripe(key);
        let mut map = stripe.map.lock();
        let Some(info) = map.get_mut(key) else {
            return;
        };
        if let Some(pos) = info.owners.iter().position(|&id| id == xid) {
            info.owners.swap_remove(pos);
            if info.owners.is_empty() {
                if info.waiters > 0 {
                    stripe.cv.notify_all();
                } else {
                    map.remove(key);
                }
            }
        }
    }
}
