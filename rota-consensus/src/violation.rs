//! Filing of penalty transactions for missed slots.
//!
//! Evidence is identified by its content hash. The filer builds a penalty
//! transaction only when that hash is neither recorded on chain nor already
//! filed by this node, so one infraction yields at most one penalty.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use rota_core::{EvidenceId, SecretKey, Transaction, ViolationEvidence};
use rota_storage::ChainStore;

/// Builds penalty transactions, deduplicated by evidence id.
pub struct ViolationFiler<S: ChainStore> {
    store: Arc<S>,
    /// Filed by this node but not necessarily confirmed yet.
    filed: Mutex<HashSet<EvidenceId>>,
}

impl<S: ChainStore> ViolationFiler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            filed: Mutex::new(HashSet::new()),
        }
    }

    /// Whether this evidence was already filed, on chain or locally.
    pub fn is_filed(&self, id: &EvidenceId) -> bool {
        if self.filed.lock().contains(id) {
            return true;
        }
        match self.store.has_evidence(id) {
            Ok(found) => found,
            Err(e) => {
                // An unreadable store counts as filed.
                warn!(evidence = %id, error = %e, "Evidence lookup failed");
                true
            }
        }
    }

    /// Build a signed penalty transaction for `evidence`, or `None` if it
    /// was already filed.
    pub fn file(
        &self,
        evidence: ViolationEvidence,
        filer: &SecretKey,
        timestamp: i64,
    ) -> Option<Transaction> {
        let id = evidence.id();
        if self.is_filed(&id) {
            debug!(evidence = %id, target = %evidence.target(), "Evidence already filed");
            return None;
        }
        self.filed.lock().insert(id);
        debug!(evidence = %id, target = %evidence.target(), "Filing violation evidence");
        Some(Transaction::violation(evidence, filer, timestamp))
    }

    /// Allow `id` to be filed again (its penalty never made it into a block).
    pub fn forget(&self, id: &EvidenceId) {
        self.filed.lock().remove(id);
    }

    /// Drop local records that are now confirmed on chain.
    pub fn prune_confirmed(&self) -> usize {
        let mut filed = self.filed.lock();
        let before = filed.len();
        filed.retain(|id| !matches!(self.store.has_evidence(id), Ok(true)));
        before - filed.len()
    }

    pub fn pending(&self) -> usize {
        self.filed.lock().len()
    }
}
