//! Registry of consensus accounts.
//!
//! Holds the producers eligible for a slot:
//! - Ordered by registration (slot order inside a round follows it)
//! - Every entry satisfies `derive_address(public_key) == address`
//! - Mismatched pairs are never installed and are purged on load

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use rota_core::{derive_address, hash, ConsensusAccount, Hash, Hash160, PublicKey};

#[derive(Debug, Default)]
struct PoolInner {
    members: Vec<ConsensusAccount>,
    lookup: HashMap<Hash160, PublicKey>,
}

impl PoolInner {
    fn insert(&mut self, account: ConsensusAccount) -> bool {
        if self.lookup.contains_key(&account.address) {
            return false;
        }
        self.lookup.insert(account.address, account.public_key);
        self.members.push(account);
        true
    }

    fn remove(&mut self, address: &Hash160) -> bool {
        if self.lookup.remove(address).is_none() {
            return false;
        }
        self.members.retain(|m| &m.address != address);
        true
    }
}

/// Shared registry of producers. Each operation is atomic.
#[derive(Debug, Default)]
pub struct ConsensusPool {
    inner: RwLock<PoolInner>,
}

impl ConsensusPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from persisted registrations, dropping any entry whose
    /// address does not derive from its key.
    pub fn load(accounts: impl IntoIterator<Item = ConsensusAccount>) -> Self {
        let mut inner = PoolInner::default();
        for account in accounts {
            inner.insert(account);
        }
        let pool = Self {
            inner: RwLock::new(inner),
        };
        let purged = pool.verify();
        if purged > 0 {
            warn!(purged, "Purged inconsistent consensus accounts on load");
        }
        pool
    }

    /// Whether `address` really derives from `public_key`.
    pub fn verify_one(address: &Hash160, public_key: &PublicKey) -> bool {
        derive_address(public_key) == *address
    }

    /// Re-check every entry and remove the ones that fail.
    ///
    /// Returns the number of entries removed.
    pub fn verify(&self) -> usize {
        let mut inner = self.inner.write();
        let bad: Vec<Hash160> = inner
            .members
            .iter()
            .filter(|m| !Self::verify_one(&m.address, &m.public_key))
            .map(|m| m.address)
            .collect();
        for address in &bad {
            inner.remove(address);
        }
        bad.len()
    }

    /// Register a producer. Mismatched pairs are logged and ignored.
    ///
    /// Returns true if the pool changed.
    pub fn add(&self, address: Hash160, public_key: PublicKey) -> bool {
        if !Self::verify_one(&address, &public_key) {
            warn!(%address, "Rejected consensus registration: address does not match key");
            return false;
        }
        let added = self.inner.write().insert(ConsensusAccount {
            address,
            public_key,
        });
        if added {
            debug!(%address, "Consensus account registered");
        }
        added
    }

    /// Remove a producer. Returns true if it was present.
    pub fn delete(&self, address: &Hash160) -> bool {
        let removed = self.inner.write().remove(address);
        if removed {
            debug!(%address, "Consensus account removed");
        }
        removed
    }

    pub fn contains(&self, address: &Hash160) -> bool {
        self.inner.read().lookup.contains_key(address)
    }

    pub fn get_pubkey(&self, address: &Hash160) -> Option<PublicKey> {
        self.inner.read().lookup.get(address).copied()
    }

    /// Snapshot of the members in slot order.
    pub fn members(&self) -> Vec<ConsensusAccount> {
        self.inner.read().members.clone()
    }

    /// Slot position of a member.
    pub fn index_of(&self, address: &Hash160) -> Option<usize> {
        self.inner
            .read()
            .members
            .iter()
            .position(|m| &m.address == address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().members.is_empty()
    }

    /// Commitment over the ordered member addresses.
    pub fn commitment(&self) -> Hash {
        let inner = self.inner.read();
        let mut data = Vec::with_capacity(inner.members.len() * 20);
        for m in &inner.members {
            data.extend_from_slice(m.address.as_bytes());
        }
        hash(&data)
    }
}
