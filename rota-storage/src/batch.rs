//! Atomic write sets.
//!
//! Committing a block touches several namespaces (blocks, transactions,
//! spent flags, filed evidence, consensus accounts). [`StorageBatch::for_block`]
//! derives every write a block implies so a store can apply them all or none.

use rota_core::{
    Block, BlockHash, ConsensusAccount, EvidenceId, Hash160, OutPoint, Result, TxId, TxPayload,
};

use crate::traits::TxRecord;

/// An operation to include in a batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Store a block and make it the tip if it is higher than the current one.
    PutBlock(Block),
    /// Index a confirmed transaction.
    PutTransaction(TxRecord),
    /// Flag an output as spent by `spender`.
    MarkSpent { outpoint: OutPoint, spender: TxId },
    /// Record filed evidence.
    PutEvidence { id: EvidenceId, block: BlockHash },
    /// Register a consensus account.
    PutAccount(ConsensusAccount),
    /// Withdraw a consensus account.
    DeleteAccount(Hash160),
}

/// A batch of operations to commit atomically.
#[derive(Debug, Default)]
pub struct StorageBatch {
    ops: Vec<BatchOp>,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    /// Every write implied by persisting `block`.
    pub fn for_block(block: &Block) -> Self {
        let hash = block.hash();
        let height = block.height();
        let mut batch = Self::with_capacity(1 + block.transactions.len() * 2);

        for tx in &block.transactions {
            let id = tx.id();
            for input in &tx.inputs {
                batch.mark_spent(input.outpoint, id);
            }
            match &tx.payload {
                TxPayload::Register { public_key } => {
                    batch.put_account(ConsensusAccount::from_public_key(*public_key));
                }
                TxPayload::Revoke { address } => {
                    batch.delete_account(*address);
                }
                TxPayload::Violation { evidence } => {
                    batch.put_evidence(evidence.id(), hash);
                }
                _ => {}
            }
            batch.put_transaction(TxRecord {
                tx: tx.clone(),
                height,
                block: hash,
            });
        }

        batch.put_block(block.clone());
        batch
    }

    pub fn put_block(&mut self, block: Block) -> &mut Self {
        self.ops.push(BatchOp::PutBlock(block));
        self
    }

    pub fn put_transaction(&mut self, record: TxRecord) -> &mut Self {
        self.ops.push(BatchOp::PutTransaction(record));
        self
    }

    pub fn mark_spent(&mut self, outpoint: OutPoint, spender: TxId) -> &mut Self {
        self.ops.push(BatchOp::MarkSpent { outpoint, spender });
        self
    }

    pub fn put_evidence(&mut self, id: EvidenceId, block: BlockHash) -> &mut Self {
        self.ops.push(BatchOp::PutEvidence { id, block });
        self
    }

    pub fn put_account(&mut self, account: ConsensusAccount) -> &mut Self {
        self.ops.push(BatchOp::PutAccount(account));
        self
    }

    pub fn delete_account(&mut self, address: Hash160) -> &mut Self {
        self.ops.push(BatchOp::DeleteAccount(address));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Trait for stores that support batch writes.
pub trait BatchWriter {
    /// Commit a batch of operations atomically.
    fn commit(&self, batch: StorageBatch) -> Result<()>;
}
