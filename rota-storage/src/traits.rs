//! Storage traits.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use rota_core::{
    Block, BlockHash, BlockHeader, ConsensusAccount, EvidenceId, Hash160, OutPoint, Result,
    Transaction, TxId,
};

use crate::batch::{BatchWriter, StorageBatch};

/// A confirmed transaction and where it was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    pub height: u64,
    pub block: BlockHash,
}

/// Keys of the raw chain-state namespace.
pub mod keys {
    use rota_core::{EvidenceId, Hash160, OutPoint};

    /// Present once the output has been spent; value is the spender's id.
    pub fn spent(outpoint: &OutPoint) -> Vec<u8> {
        let mut key = Vec::with_capacity(6 + 32 + 4);
        key.extend_from_slice(b"spent:");
        key.extend_from_slice(outpoint.tx.as_hash().as_bytes());
        key.extend_from_slice(&outpoint.index.to_be_bytes());
        key
    }

    /// Present once the evidence has been filed on chain; value is the block hash.
    pub fn evidence(id: &EvidenceId) -> Vec<u8> {
        let mut key = Vec::with_capacity(9 + 32);
        key.extend_from_slice(b"evidence:");
        key.extend_from_slice(id.0.as_bytes());
        key
    }

    /// Present while the address is a registered consensus account.
    pub fn account(address: &Hash160) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + 20);
        key.extend_from_slice(b"account:");
        key.extend_from_slice(address.as_bytes());
        key
    }
}

/// Store for blocks.
pub trait BlockStore {
    /// Get a block by hash.
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>>;

    /// Get the main-chain block at a height.
    fn get_block_at(&self, height: u64) -> Result<Option<Block>>;

    /// Get a block header by hash.
    fn get_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        Ok(self.get_block(hash)?.map(|b| b.header))
    }

    /// Header of the chain tip. Fails on an empty store.
    fn get_best_block_header(&self) -> Result<BlockHeader>;
}

/// Chain-state lookups.
pub trait StateStore {
    fn get_transaction(&self, id: &TxId) -> Result<Option<TxRecord>>;

    /// Raw chain-state lookup; see [`keys`].
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Addresses this node watches ("is this mine").
    fn get_account_filter(&self) -> Result<HashSet<Hash160>>;

    /// Registered consensus accounts in registration order.
    fn consensus_accounts(&self) -> Result<Vec<ConsensusAccount>>;
}

/// Everything the chain needs from storage.
pub trait ChainStore: BlockStore + StateStore + BatchWriter + Send + Sync {
    /// Persist a block with all state changes it implies, atomically.
    fn save_block(&self, block: &Block) -> Result<()> {
        self.commit(StorageBatch::for_block(block))
    }

    fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.get_raw(&keys::spent(outpoint))?.is_some())
    }

    fn has_evidence(&self, id: &EvidenceId) -> Result<bool> {
        Ok(self.get_raw(&keys::evidence(id))?.is_some())
    }

    fn has_transaction(&self, id: &TxId) -> Result<bool> {
        Ok(self.get_transaction(id)?.is_some())
    }
}
