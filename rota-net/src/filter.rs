//! Recently-seen inventory filter.
//!
//! Every block, transaction and meeting message the node relays is recorded
//! here first. A hash already present is never relayed again, which keeps
//! flood relay from echoing between peers. The filter is bounded and forgets
//! the oldest hashes first.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use rota_core::Hash;

/// Configuration for the inventory filter.
#[derive(Debug, Clone)]
pub struct InventoryFilterConfig {
    /// Maximum number of remembered hashes.
    pub capacity: usize,
}

impl Default for InventoryFilterConfig {
    fn default() -> Self {
        Self { capacity: 50_000 }
    }
}

#[derive(Default)]
struct FilterInner {
    seen: HashSet<Hash>,
    order: VecDeque<Hash>,
}

/// Bounded FIFO set of recently seen hashes.
pub struct InventoryFilter {
    config: InventoryFilterConfig,
    inner: Mutex<FilterInner>,
}

impl InventoryFilter {
    pub fn new(config: InventoryFilterConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(FilterInner::default()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(InventoryFilterConfig { capacity })
    }

    /// Record `hash`. Returns `true` only the first time it is seen.
    pub fn insert(&self, hash: Hash) -> bool {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(hash) {
            return false;
        }
        inner.order.push_back(hash);
        while inner.order.len() > self.config.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.seen.clear();
        inner.order.clear();
    }
}

impl Default for InventoryFilter {
    fn default() -> Self {
        Self::new(InventoryFilterConfig::default())
    }
}
