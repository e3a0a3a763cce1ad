//! In-memory chain store.
//!
//! Reference implementation of [`ChainStore`]: all namespaces live behind one
//! `RwLock`, so a batch is applied atomically with respect to readers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use rota_core::{
    Block, BlockHash, BlockHeader, ConsensusAccount, Error, Hash160, Result, TxId,
};

use crate::batch::{BatchOp, BatchWriter, StorageBatch};
use crate::traits::{keys, BlockStore, ChainStore, StateStore, TxRecord};

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<BlockHash, Block>,
    by_height: BTreeMap<u64, BlockHash>,
    best: Option<BlockHash>,
    txs: HashMap<TxId, TxRecord>,
    raw: HashMap<Vec<u8>, Vec<u8>>,
    accounts: Vec<ConsensusAccount>,
    watched: HashSet<Hash160>,
}

/// Chain store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `genesis` as its only block.
    pub fn with_genesis(genesis: &Block) -> Result<Self> {
        let store = Self::new();
        store.save_block(genesis)?;
        Ok(store)
    }

    /// Add an address to the account filter.
    pub fn watch(&self, address: Hash160) {
        self.inner.write().watched.insert(address);
    }

    /// Make every subsequent commit fail with a write error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl BatchWriter for MemoryStore {
    fn commit(&self, batch: StorageBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage_write("memory store configured to fail writes"));
        }

        let mut inner = self.inner.write();

        // Reject the whole batch before touching anything.
        for op in batch.ops() {
            if let BatchOp::PutBlock(block) = op {
                if inner.blocks.contains_key(&block.hash()) {
                    return Err(Error::duplicate_block(block.hash().to_string()));
                }
            }
        }

        let count = batch.len();
        for op in batch.into_ops() {
            match op {
                BatchOp::PutBlock(block) => {
                    let hash = block.hash();
                    let height = block.height();
                    let best_height = inner
                        .best
                        .and_then(|h| inner.blocks.get(&h))
                        .map(|b| b.height());
                    if best_height.map_or(true, |best| height > best) {
                        inner.best = Some(hash);
                        inner.by_height.insert(height, hash);
                    }
                    inner.blocks.insert(hash, block);
                }
                BatchOp::PutTransaction(record) => {
                    inner.txs.insert(record.tx.id(), record);
                }
                BatchOp::MarkSpent { outpoint, spender } => {
                    inner
                        .raw
                        .insert(keys::spent(&outpoint), spender.0.as_bytes().to_vec());
                }
                BatchOp::PutEvidence { id, block } => {
                    inner
                        .raw
                        .insert(keys::evidence(&id), block.0.as_bytes().to_vec());
                }
                BatchOp::PutAccount(account) => {
                    inner
                        .raw
                        .insert(keys::account(&account.address), account.public_key.as_bytes().to_vec());
                    inner.accounts.retain(|a| a.address != account.address);
                    inner.accounts.push(account);
                }
                BatchOp::DeleteAccount(address) => {
                    inner.raw.remove(&keys::account(&address));
                    inner.accounts.retain(|a| a.address != address);
                }
            }
        }

        debug!(ops = count, "Committed storage batch");
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn get_block_at(&self, height: u64) -> Result<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .by_height
            .get(&height)
            .and_then(|h| inner.blocks.get(h))
            .cloned())
    }

    fn get_best_block_header(&self) -> Result<BlockHeader> {
        let inner = self.inner.read();
        inner
            .best
            .and_then(|h| inner.blocks.get(&h))
            .map(|b| b.header.clone())
            .ok_or_else(|| Error::block_not_found("store has no blocks"))
    }
}

impl StateStore for MemoryStore {
    fn get_transaction(&self, id: &TxId) -> Result<Option<TxRecord>> {
        Ok(self.inner.read().txs.get(id).cloned())
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().raw.get(key).cloned())
    }

    fn get_account_filter(&self) -> Result<HashSet<Hash160>> {
        Ok(self.inner.read().watched.clone())
    }

    fn consensus_accounts(&self) -> Result<Vec<ConsensusAccount>> {
        Ok(self.inner.read().accounts.clone())
    }
}

impl ChainStore for MemoryStore {}
