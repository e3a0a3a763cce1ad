//! Transaction validation in chain context.
//!
//! [`TransactionValidator::validate`] judges a transaction against the
//! persisted chain plus an ordered list of transactions that precede it (the
//! block being assembled, or the block being received). The same check runs
//! at mempool admission, during assembly and during final re-validation.

use std::sync::Arc;

use rota_core::{
    EvidenceId, Hash160, OutPoint, Transaction, TxId, TxKind, TxOutput, TxPayload,
};
use rota_storage::ChainStore;

use crate::consensus_pool::ConsensusPool;

/// Why a transaction was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum TxRejection {
    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("transaction {0} already confirmed")]
    AlreadyConfirmed(TxId),

    #[error("transaction {0} appears twice in context")]
    DuplicateInContext(TxId),

    #[error("coinbase is only valid as the first transaction of a block")]
    UnexpectedCoinbase,

    #[error("input {0:?} already spent on chain")]
    InputSpent(OutPoint),

    #[error("input {0:?} spent twice in the same context")]
    DoubleSpend(OutPoint),

    /// The referenced transaction is neither confirmed nor earlier in context.
    #[error("input {0:?} references an unconfirmed transaction")]
    UnconfirmedInput(OutPoint),

    #[error("input {0:?} references a missing output")]
    UnknownOutput(OutPoint),

    #[error("input {0:?} declares a value different from the spent output")]
    InputValueMismatch(OutPoint),

    #[error("input {0:?} is not owned by the signer")]
    NotOwner(OutPoint),

    #[error("input {outpoint:?} locked until height {lock_time}")]
    OutputLocked { outpoint: OutPoint, lock_time: u64 },

    #[error("{0} is not a consensus account")]
    NotConsensusMember(Hash160),

    #[error("{0} is already a consensus account")]
    AlreadyRegistered(Hash160),

    #[error("evidence {0} already filed")]
    EvidenceAlreadyFiled(EvidenceId),

    #[error("storage error: {0}")]
    Storage(#[from] rota_core::Error),
}

impl TxRejection {
    /// The transaction may become valid once the transaction it spends from
    /// is packaged first.
    pub fn is_ordering_deferral(&self) -> bool {
        matches!(self, TxRejection::UnconfirmedInput(_))
    }
}

/// Judges transactions against chain state and preceding context.
pub trait TransactionValidator: Send + Sync {
    fn validate(&self, tx: &Transaction, context: &[Transaction]) -> Result<(), TxRejection>;
}

/// Validator backed by the chain store and the consensus pool.
pub struct ChainValidator<S: ChainStore> {
    store: Arc<S>,
    pool: Arc<ConsensusPool>,
}

impl<S: ChainStore> ChainValidator<S> {
    pub fn new(store: Arc<S>, pool: Arc<ConsensusPool>) -> Self {
        Self { store, pool }
    }

    /// Find the output an input spends, with the lock time of its transaction.
    fn resolve(
        &self,
        outpoint: &OutPoint,
        context: &[Transaction],
    ) -> Result<(TxOutput, u64), TxRejection> {
        let source = match context.iter().find(|c| c.id() == outpoint.tx) {
            Some(tx) => tx.clone(),
            None => match self.store.get_transaction(&outpoint.tx)? {
                Some(record) => record.tx,
                None => return Err(TxRejection::UnconfirmedInput(*outpoint)),
            },
        };
        source
            .outputs
            .get(outpoint.index as usize)
            .map(|o| (*o, source.lock_time))
            .ok_or(TxRejection::UnknownOutput(*outpoint))
    }

    fn validate_payment(&self, tx: &Transaction, context: &[Transaction]) -> Result<(), TxRejection> {
        let signer = tx
            .signer()
            .ok_or_else(|| TxRejection::Malformed("missing witness".into()))?;
        let next_height = self.store.get_best_block_header()?.height + 1;

        for (i, input) in tx.inputs.iter().enumerate() {
            let outpoint = input.outpoint;
            if tx.inputs[..i].iter().any(|other| other.outpoint == outpoint) {
                return Err(TxRejection::DoubleSpend(outpoint));
            }
            if self.store.is_spent(&outpoint)? {
                return Err(TxRejection::InputSpent(outpoint));
            }
            if context
                .iter()
                .any(|c| c.inputs.iter().any(|ci| ci.outpoint == outpoint))
            {
                return Err(TxRejection::DoubleSpend(outpoint));
            }

            let (output, lock_time) = self.resolve(&outpoint, context)?;
            if lock_time > next_height {
                return Err(TxRejection::OutputLocked {
                    outpoint,
                    lock_time,
                });
            }
            if output.value != input.value {
                return Err(TxRejection::InputValueMismatch(outpoint));
            }
            if output.recipient != signer {
                return Err(TxRejection::NotOwner(outpoint));
            }
        }
        Ok(())
    }

    fn require_member(&self, tx: &Transaction) -> Result<Hash160, TxRejection> {
        let signer = tx
            .signer()
            .ok_or_else(|| TxRejection::Malformed("missing witness".into()))?;
        if !self.pool.contains(&signer) {
            return Err(TxRejection::NotConsensusMember(signer));
        }
        Ok(signer)
    }
}

impl<S: ChainStore> TransactionValidator for ChainValidator<S> {
    fn validate(&self, tx: &Transaction, context: &[Transaction]) -> Result<(), TxRejection> {
        if tx.kind() == TxKind::Coinbase {
            return Err(TxRejection::UnexpectedCoinbase);
        }
        tx.verify_structure()
            .map_err(|e| TxRejection::Malformed(e.to_string()))?;

        let id = tx.id();
        if self.store.has_transaction(&id)? {
            return Err(TxRejection::AlreadyConfirmed(id));
        }
        if context.iter().any(|c| c.id() == id) {
            return Err(TxRejection::DuplicateInContext(id));
        }

        match &tx.payload {
            TxPayload::Coinbase { .. } => Err(TxRejection::UnexpectedCoinbase),
            TxPayload::Payment => self.validate_payment(tx, context),
            TxPayload::Register { .. } => {
                let address = tx
                    .signer()
                    .ok_or_else(|| TxRejection::Malformed("missing witness".into()))?;
                let pending = context.iter().any(|c| {
                    matches!(c.payload, TxPayload::Register { .. }) && c.signer() == Some(address)
                });
                if self.pool.contains(&address) || pending {
                    return Err(TxRejection::AlreadyRegistered(address));
                }
                Ok(())
            }
            TxPayload::Revoke { address } => {
                if !self.pool.contains(address) {
                    return Err(TxRejection::NotConsensusMember(*address));
                }
                Ok(())
            }
            TxPayload::Violation { evidence } => {
                self.require_member(tx)?;
                let evidence_id = evidence.id();
                let in_context = context.iter().any(|c| {
                    matches!(&c.payload, TxPayload::Violation { evidence } if evidence.id() == evidence_id)
                });
                if in_context || self.store.has_evidence(&evidence_id)? {
                    return Err(TxRejection::EvidenceAlreadyFiled(evidence_id));
                }
                Ok(())
            }
            TxPayload::Credit { .. } => self.require_member(tx).map(|_| ()),
        }
    }
}
