//! Mutual exclusion keyed by owner or certificate id.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// One mutex per key, created on first use.
///
/// Guards are owned so callers can hold several (owner, then certificate) without borrowing the
/// registry. Entries are dropped again once no guard or waiter references them.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

pub type KeyedGuard = ArcMutexGuard<RawMutex, ()>;

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock(&self, key: &K) -> KeyedGuard {
        let slot = {
            let mut slots = self.slots.lock();
            // Only the map holds an idle slot; prune those while we are here.
            slots.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        slot.lock_arc()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
