//! Mempool for pending transactions.
//!
//! The mempool holds transactions waiting to be packaged into a block:
//! - FIFO retrieval by arrival order
//! - Idempotent insertion keyed by transaction id
//! - Front re-insertion for transactions handed back by an aborted assembly
//! - Expiration (TTL) and size limits with eviction
//!
//! It is shared between block assembly and message dispatch, so every
//! operation takes `&self` and completes under a single lock acquisition.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use rota_core::{Transaction, TxId};

/// Configuration for the mempool.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of transactions in the pool.
    pub max_size: usize,
    /// Time-to-live for transactions (after which they're evicted).
    pub ttl: Duration,
    /// Maximum serialized size of a single transaction in bytes.
    pub max_tx_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 50_000,
            ttl: Duration::hours(24),
            max_tx_size: 100 * 1024,
        }
    }
}

/// An entry in the mempool.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// When the transaction was added to the mempool.
    pub added_at: DateTime<Utc>,
}

impl MempoolEntry {
    fn new(tx: Transaction) -> Self {
        Self {
            tx,
            added_at: Utc::now(),
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.added_at > ttl
    }
}

#[derive(Debug, Default)]
struct MempoolInner {
    /// Arrival order.
    queue: VecDeque<TxId>,
    entries: HashMap<TxId, MempoolEntry>,
}

impl MempoolInner {
    fn pop_front(&mut self) -> Option<Transaction> {
        while let Some(id) = self.queue.pop_front() {
            if let Some(entry) = self.entries.remove(&id) {
                return Some(entry.tx);
            }
        }
        None
    }

    fn pop_back(&mut self) -> Option<Transaction> {
        while let Some(id) = self.queue.pop_back() {
            if let Some(entry) = self.entries.remove(&id) {
                return Some(entry.tx);
            }
        }
        None
    }

    /// Drop queue slots whose entry is gone.
    fn compact(&mut self) {
        let entries = &self.entries;
        self.queue.retain(|id| entries.contains_key(id));
    }
}

/// Mempool for pending transactions.
#[derive(Debug)]
pub struct Mempool {
    config: MempoolConfig,
    inner: Mutex<MempoolInner>,
}

impl Mempool {
    /// Create a new mempool with the given configuration.
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(MempoolInner::default()),
        }
    }

    /// Create a mempool with default configuration.
    pub fn default_config() -> Self {
        Self::new(MempoolConfig::default())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Add a transaction at the back of the queue.
    ///
    /// Returns `false` without touching the pool if the id is already
    /// pending or the transaction exceeds the size limit.
    pub fn add(&self, tx: Transaction) -> bool {
        let size = bincode::serialized_size(&tx).unwrap_or(u64::MAX);
        if size > self.config.max_tx_size as u64 {
            debug!(size, limit = self.config.max_tx_size, "Transaction too large for mempool");
            return false;
        }

        let id = tx.id();
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return false;
        }
        if inner.entries.len() >= self.config.max_size {
            // Evict the oldest arrival.
            if let Some(evicted) = inner.pop_front() {
                debug!(tx = %evicted.id(), "Mempool full, evicted oldest transaction");
            }
        }
        inner.entries.insert(id, MempoolEntry::new(tx));
        inner.queue.push_back(id);
        true
    }

    /// Put transactions back at the front of the queue, preserving their
    /// relative order. Ids already pending are skipped.
    ///
    /// Returns the number re-inserted.
    pub fn requeue(&self, txs: Vec<Transaction>) -> usize {
        let mut inner = self.inner.lock();
        let mut inserted = 0;
        for tx in txs.into_iter().rev() {
            let id = tx.id();
            if inner.entries.contains_key(&id) {
                continue;
            }
            inner.entries.insert(id, MempoolEntry::new(tx));
            inner.queue.push_front(id);
            inserted += 1;
        }
        inserted
    }

    /// Remove and return the oldest pending transaction.
    pub fn get(&self) -> Option<Transaction> {
        self.inner.lock().pop_front()
    }

    /// Remove and return up to `n` of the most recently added transactions.
    pub fn get_newest(&self, n: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(n.min(inner.entries.len()));
        while out.len() < n {
            match inner.pop_back() {
                Some(tx) => out.push(tx),
                None => break,
            }
        }
        out
    }

    /// Look up a pending transaction without removing it.
    pub fn get_by_id(&self, id: &TxId) -> Option<Transaction> {
        self.inner.lock().entries.get(id).map(|e| e.tx.clone())
    }

    /// Remove specific transactions (after they're included in a block).
    ///
    /// Returns the number removed.
    pub fn remove(&self, ids: &[TxId]) -> usize {
        let mut inner = self.inner.lock();
        let removed = ids
            .iter()
            .filter(|id| inner.entries.remove(*id).is_some())
            .count();
        if removed > 0 {
            inner.compact();
        }
        removed
    }

    /// Remove expired transactions.
    ///
    /// Returns the number removed.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(ttl));
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            inner.compact();
        }
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.entries.clear();
    }

    /// Get mempool statistics.
    pub fn stats(&self) -> MempoolStats {
        let inner = self.inner.lock();
        let now = Utc::now();
        MempoolStats {
            size: inner.entries.len(),
            capacity: self.config.max_size,
            oldest_age_ms: inner
                .entries
                .values()
                .map(|e| (now - e.added_at).num_milliseconds())
                .max()
                .unwrap_or(0),
        }
    }
}

/// Mempool statistics.
#[derive(Debug, Clone)]
pub struct MempoolStats {
    /// Current number of transactions.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Age of oldest transaction in milliseconds.
    pub oldest_age_ms: i64,
}
