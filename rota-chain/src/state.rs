//! Chain state management.
//!
//! `ChainState` is the single writer of the chain. Committing a block:
//! - checks it extends the current tip
//! - persists it (with every implied state change) in one storage batch
//! - drops its transactions from the mempool
//! - applies registrations and revocations to the consensus pool
//! - notifies block-changed listeners

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use rota_core::{Block, BlockHash, BlockHeader, ChainParams, TxKind, TxPayload};
use rota_storage::ChainStore;

use crate::consensus_pool::ConsensusPool;
use crate::mempool::Mempool;
use crate::validator::{TransactionValidator, TxRejection};

/// Observer of tip changes.
pub trait BlockChangedListener: Send + Sync {
    fn on_changed(&self, old_height: u64, new_height: u64, old_hash: BlockHash, new_hash: BlockHash);
}

/// Result of applying a block.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub block_hash: BlockHash,
    /// New chain height.
    pub height: u64,
    pub tx_count: usize,
    /// Transactions of the block that were still pending in the mempool.
    pub removed_from_mempool: usize,
}

/// Errors specific to chain state operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("invalid parent hash: expected {expected}, got {got}")]
    InvalidParent { expected: BlockHash, got: BlockHash },

    #[error("block {0} already known")]
    AlreadyKnown(BlockHash),

    #[error("block produced by unknown account: {0}")]
    UnknownProducer(String),

    #[error("block validation failed: {0}")]
    BlockValidation(String),

    #[error("coinbase pays {paid}, at most {allowed} allowed")]
    ExcessiveCoinbase { paid: i64, allowed: i64 },

    #[error("transaction {index} rejected: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: TxRejection,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rota_core::Error),
}

/// Shared handle on the chain and the structures kept consistent with it.
pub struct ChainState<S: ChainStore> {
    store: Arc<S>,
    pool: Arc<ConsensusPool>,
    mempool: Arc<Mempool>,
    validator: Arc<dyn TransactionValidator>,
    params: ChainParams,
    /// Serializes commits so tip checks and writes are not interleaved.
    commit_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn BlockChangedListener>>>,
}

impl<S: ChainStore> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        pool: Arc<ConsensusPool>,
        mempool: Arc<Mempool>,
        validator: Arc<dyn TransactionValidator>,
        params: ChainParams,
    ) -> Self {
        Self {
            store,
            pool,
            mempool,
            validator,
            params,
            commit_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ConsensusPool> {
        &self.pool
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn validator(&self) -> &Arc<dyn TransactionValidator> {
        &self.validator
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn add_listener(&self, listener: Arc<dyn BlockChangedListener>) {
        self.listeners.write().push(listener);
    }

    /// Header of the current tip.
    pub fn best_header(&self) -> Result<BlockHeader, ChainError> {
        Ok(self.store.get_best_block_header()?)
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        Ok(self.best_header()?.height)
    }

    /// Full validation of a block received from the network.
    pub fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        let tip = self.best_header()?;
        self.validate_against(block, &tip)
    }

    fn validate_against(&self, block: &Block, tip: &BlockHeader) -> Result<(), ChainError> {
        self.check_extends(block, tip)?;
        block
            .validate(Some(tip))
            .map_err(|e| ChainError::BlockValidation(e.to_string()))?;

        let producer = block.header.producer_address();
        if self.pool.get_pubkey(&producer) != Some(block.header.producer) {
            return Err(ChainError::UnknownProducer(producer.to_string()));
        }

        let coinbase = block
            .coinbase()
            .ok_or_else(|| ChainError::BlockValidation("missing coinbase".into()))?;
        if coinbase.lock_time != self.params.coinbase_lock_time(block.height()) {
            return Err(ChainError::BlockValidation("coinbase lock time".into()));
        }
        let fees = block
            .total_fees()
            .map_err(|e| ChainError::BlockValidation(e.to_string()))?;
        let allowed = fees + self.params.block_reward(block.height());
        let paid = coinbase
            .output_value()
            .map_err(|e| ChainError::BlockValidation(e.to_string()))?;
        if paid > allowed {
            return Err(ChainError::ExcessiveCoinbase { paid, allowed });
        }

        let body = &block.transactions[1..];
        for (i, tx) in body.iter().enumerate() {
            self.validator
                .validate(tx, &body[..i])
                .map_err(|source| ChainError::Transaction {
                    index: i + 1,
                    source,
                })?;
        }
        Ok(())
    }

    fn check_extends(&self, block: &Block, tip: &BlockHeader) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.store.get_block(&hash)?.is_some() {
            return Err(ChainError::AlreadyKnown(hash));
        }
        if block.height() != tip.height + 1 {
            return Err(ChainError::HeightMismatch {
                expected: tip.height + 1,
                got: block.height(),
            });
        }
        let expected = tip.hash();
        if block.header.prev_hash != expected {
            return Err(ChainError::InvalidParent {
                expected,
                got: block.header.prev_hash,
            });
        }
        Ok(())
    }

    /// Validate and commit a block received from a peer.
    pub fn accept_block(&self, block: &Block) -> Result<ApplyResult, ChainError> {
        let _guard = self.commit_lock.lock();
        let tip = self.best_header()?;
        self.validate_against(block, &tip)?;
        self.apply(block, &tip)
    }

    /// Commit a locally produced block that was validated during assembly.
    pub fn commit_block(&self, block: &Block) -> Result<ApplyResult, ChainError> {
        let _guard = self.commit_lock.lock();
        let tip = self.best_header()?;
        self.check_extends(block, &tip)?;
        self.apply(block, &tip)
    }

    fn apply(&self, block: &Block, tip: &BlockHeader) -> Result<ApplyResult, ChainError> {
        self.store.save_block(block)?;

        let ids = block.tx_ids();
        let removed_from_mempool = self.mempool.remove(&ids);

        for tx in &block.transactions {
            match &tx.payload {
                TxPayload::Register { public_key } => {
                    if let Some(address) = tx.signer() {
                        self.pool.add(address, *public_key);
                    }
                }
                TxPayload::Revoke { address } => {
                    self.pool.delete(address);
                }
                _ => {}
            }
        }

        let hash = block.hash();
        let violations = block
            .transactions
            .iter()
            .filter(|tx| tx.kind() == TxKind::Violation)
            .count();
        info!(
            height = block.height(),
            txs = block.transactions.len(),
            violations,
            hash = %hash,
            "Committed block"
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_changed(tip.height, block.height(), tip.hash(), hash);
        }

        Ok(ApplyResult {
            block_hash: hash,
            height: block.height(),
            tx_count: block.transactions.len(),
            removed_from_mempool,
        })
    }

    /// Rebuild the consensus pool from persisted registrations.
    pub fn reload_pool(&self) -> Result<usize, ChainError> {
        let accounts = self.store.consensus_accounts()?;
        let mut installed = 0;
        for account in accounts {
            if self.pool.add(account.address, account.public_key) {
                installed += 1;
            }
        }
        let purged = self.pool.verify();
        if purged > 0 {
            warn!(purged, "Consensus pool entries failed verification");
        }
        debug!(installed, members = self.pool.len(), "Reloaded consensus pool");
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use rota_core::{
        derive_address, BlockBuilder, Hash160, OutPoint, SecretKey, Transaction, TxInput, TxOutput,
    };
    use rota_storage::{MemoryStore, StateStore};

    use crate::validator::ChainValidator;

    struct Recorder(AtomicU64);

    impl BlockChangedListener for Recorder {
        fn on_changed(&self, _old: u64, new_height: u64, _old_hash: BlockHash, _new_hash: BlockHash) {
            self.0.store(new_height, Ordering::SeqCst);
        }
    }

    fn setup() -> (SecretKey, ChainState<MemoryStore>, Block) {
        let key = SecretKey::generate();
        let genesis = BlockBuilder::new()
            .transactions(vec![Transaction::register(&key, 0)])
            .seal(&key);
        let store = Arc::new(MemoryStore::with_genesis(&genesis).unwrap());
        let pool = Arc::new(ConsensusPool::load(store.consensus_accounts().unwrap()));
        let validator = Arc::new(ChainValidator::new(store.clone(), pool.clone()));
        let state = ChainState::new(
            store,
            pool,
            Arc::new(Mempool::default_config()),
            validator,
            ChainParams::default(),
        );
        (key, state, genesis)
    }

    fn next_block(state: &ChainState<MemoryStore>, key: &SecretKey, txs: Vec<Transaction>) -> Block {
        let tip = state.best_header().unwrap();
        let height = tip.height + 1;
        let params = state.params();
        let mut all = vec![Transaction::coinbase(
            height,
            derive_address(&key.public_key()),
            params.block_reward(height),
            params.coinbase_lock_time(height),
            0,
        )];
        all.extend(txs);
        BlockBuilder::new().parent(tip).transactions(all).seal(key)
    }

    #[test]
    fn test_accept_block_updates_everything() {
        let (key, state, _) = setup();
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        state.add_listener(recorder.clone());

        let newcomer = SecretKey::generate();
        let reg = Transaction::register(&newcomer, 1);
        state.mempool().add(reg.clone());

        let block = next_block(&state, &key, vec![reg]);
        let result = state.accept_block(&block).unwrap();

        assert_eq!(result.height, 1);
        assert_eq!(result.removed_from_mempool, 1);
        assert!(state.mempool().is_empty());
        assert!(state.pool().contains(&derive_address(&newcomer.public_key())));
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revocation_removes_member() {
        let (key, state, _) = setup();
        let block = next_block(&state, &key, vec![Transaction::revoke(&key, 1)]);
        state.accept_block(&block).unwrap();
        assert!(state.pool().is_empty());
    }

    #[test]
    fn test_rejects_wrong_parent() {
        let (key, state, genesis) = setup();
        let block = next_block(&state, &key, vec![]);
        state.accept_block(&block).unwrap();

        let stale = BlockBuilder::new()
            .parent(genesis.header.clone())
            .transactions(vec![Transaction::coinbase(1, Hash160::ZERO, 0, 11, 7)])
            .seal(&key);
        assert!(matches!(
            state.accept_block(&stale),
            Err(ChainError::HeightMismatch { .. })
        ));
        assert!(matches!(
            state.accept_block(&block),
            Err(ChainError::AlreadyKnown(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_producer() {
        let (_key, state, _) = setup();
        let outsider = SecretKey::generate();
        let block = next_block(&state, &outsider, vec![]);
        assert!(matches!(
            state.accept_block(&block),
            Err(ChainError::UnknownProducer(_))
        ));
    }

    #[test]
    fn test_rejects_excessive_coinbase() {
        let (key, state, _) = setup();
        let tip = state.best_header().unwrap();
        let block = BlockBuilder::new()
            .parent(tip)
            .transactions(vec![Transaction::coinbase(
                1,
                Hash160::ZERO,
                state.params().block_reward(1) + 1,
                state.params().coinbase_lock_time(1),
                0,
            )])
            .seal(&key);
        assert!(matches!(
            state.accept_block(&block),
            Err(ChainError::ExcessiveCoinbase { .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_transaction_in_block() {
        let (key, state, _) = setup();
        let orphan = Transaction::payment(
            vec![TxInput {
                outpoint: OutPoint::new(rota_core::TxId(rota_core::hash(b"nowhere")), 0),
                value: 5,
            }],
            vec![TxOutput {
                value: 5,
                recipient: Hash160::ZERO,
            }],
            0,
        )
        .sign(&key);
        let block = next_block(&state, &key, vec![orphan]);
        assert!(matches!(
            state.accept_block(&block),
            Err(ChainError::Transaction { index: 1, .. })
        ));
        assert_eq!(state.height().unwrap(), 0);
    }

    #[test]
    fn test_commit_failure_leaves_state() {
        let (key, state, _) = setup();
        let block = next_block(&state, &key, vec![]);
        state.store().set_fail_writes(true);
        assert!(matches!(state.commit_block(&block), Err(ChainError::Storage(_))));
        assert_eq!(state.height().unwrap(), 0);
    }

    #[test]
    fn test_reload_pool() {
        let (_key, state, _) = setup();
        let member = state.pool().members()[0];
        state.pool().delete(&member.address);
        assert_eq!(state.reload_pool().unwrap(), 1);
        assert!(state.pool().contains(&member.address));
    }
}
