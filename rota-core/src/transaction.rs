//! Transactions.
//!
//! A transaction is a tagged union over the kinds the chain understands.
//! Value moves through `inputs`/`outputs` (only coinbase and payment carry
//! them); every other kind is an authorization signed by its witness.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::{derive_address, Hash160};
use crate::crypto::{hash, Hash, PublicKey, SecretKey, Sig};
use crate::error::{Error, Result};
use crate::evidence::ViolationEvidence;

/// Transaction identifier (hash of the signable body).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub Hash);

impl TxId {
    pub fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", &self.0.to_hex()[..16])
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to one output of an earlier transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx: TxId, index: u32) -> Self {
        Self { tx, index }
    }
}

/// Spends an output. `value` restates the spent amount and must match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: i64,
    pub recipient: Hash160,
}

/// Signature of the account authorizing the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub public_key: PublicKey,
    pub signature: Sig,
}

/// Kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Coinbase,
    Payment,
    Register,
    Revoke,
    Violation,
    Credit,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxKind::Coinbase => "coinbase",
            TxKind::Payment => "payment",
            TxKind::Register => "register",
            TxKind::Revoke => "revoke",
            TxKind::Violation => "violation",
            TxKind::Credit => "credit",
        };
        f.write_str(name)
    }
}

/// Kind-specific body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    /// Block reward claim; always index 0 of its block.
    Coinbase { height: u64 },
    /// Value transfer.
    Payment,
    /// Registers the witness key as a consensus account.
    Register { public_key: PublicKey },
    /// Withdraws a consensus account (signed by that account).
    Revoke { address: Hash160 },
    /// Penalty filed by a producer against a misbehaving peer.
    Violation { evidence: ViolationEvidence },
    /// Credit points granted to the payer of `source`.
    Credit {
        payer: Hash160,
        amount: u64,
        source: TxId,
    },
}

impl TxPayload {
    pub fn kind(&self) -> TxKind {
        match self {
            TxPayload::Coinbase { .. } => TxKind::Coinbase,
            TxPayload::Payment => TxKind::Payment,
            TxPayload::Register { .. } => TxKind::Register,
            TxPayload::Revoke { .. } => TxKind::Revoke,
            TxPayload::Violation { .. } => TxKind::Violation,
            TxPayload::Credit { .. } => TxKind::Credit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub payload: TxPayload,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Height before which the outputs may not be spent.
    pub lock_time: u64,
    /// Creation time, unix millis.
    pub timestamp: i64,
    pub witness: Option<Witness>,
}

/// Helper for signing and hashing (excludes the signature).
#[derive(Serialize)]
struct SignableTx<'a> {
    version: u16,
    payload: &'a TxPayload,
    inputs: &'a [TxInput],
    outputs: &'a [TxOutput],
    lock_time: u64,
    timestamp: i64,
    signer: Option<&'a PublicKey>,
}

impl Transaction {
    pub const VERSION: u16 = 1;

    fn unsigned(payload: TxPayload, timestamp: i64) -> Self {
        Self {
            version: Self::VERSION,
            payload,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            timestamp,
            witness: None,
        }
    }

    /// Reward transaction paying `value` to `recipient`, spendable from `lock_time`.
    pub fn coinbase(height: u64, recipient: Hash160, value: i64, lock_time: u64, timestamp: i64) -> Self {
        let mut tx = Self::unsigned(TxPayload::Coinbase { height }, timestamp);
        tx.outputs.push(TxOutput { value, recipient });
        tx.lock_time = lock_time;
        tx
    }

    /// Unsigned payment; call [`Transaction::sign`] before use.
    pub fn payment(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, timestamp: i64) -> Self {
        let mut tx = Self::unsigned(TxPayload::Payment, timestamp);
        tx.inputs = inputs;
        tx.outputs = outputs;
        tx
    }

    /// Self-signed registration of `key` as a consensus account.
    pub fn register(key: &SecretKey, timestamp: i64) -> Self {
        Self::unsigned(
            TxPayload::Register {
                public_key: key.public_key(),
            },
            timestamp,
        )
        .sign(key)
    }

    /// Self-signed withdrawal of the consensus account held by `key`.
    pub fn revoke(key: &SecretKey, timestamp: i64) -> Self {
        Self::unsigned(
            TxPayload::Revoke {
                address: derive_address(&key.public_key()),
            },
            timestamp,
        )
        .sign(key)
    }

    /// Penalty transaction carrying `evidence`, signed by the filing producer.
    pub fn violation(evidence: ViolationEvidence, filer: &SecretKey, timestamp: i64) -> Self {
        Self::unsigned(TxPayload::Violation { evidence }, timestamp).sign(filer)
    }

    /// Credit grant for the payer of `source`, signed by the producer.
    pub fn credit(payer: Hash160, amount: u64, source: TxId, producer: &SecretKey, timestamp: i64) -> Self {
        Self::unsigned(
            TxPayload::Credit {
                payer,
                amount,
                source,
            },
            timestamp,
        )
        .sign(producer)
    }

    pub fn kind(&self) -> TxKind {
        self.payload.kind()
    }

    pub fn is_coinbase(&self) -> bool {
        self.kind() == TxKind::Coinbase
    }

    /// Bytes covered by the witness signature and the id.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let signable = SignableTx {
            version: self.version,
            payload: &self.payload,
            inputs: &self.inputs,
            outputs: &self.outputs,
            lock_time: self.lock_time,
            timestamp: self.timestamp,
            signer: self.witness.as_ref().map(|w| &w.public_key),
        };
        bincode::serialize(&signable).expect("serialization should not fail")
    }

    pub fn id(&self) -> TxId {
        TxId(hash(&self.signing_bytes()))
    }

    /// Attach a witness signed by `key`.
    pub fn sign(mut self, key: &SecretKey) -> Self {
        self.witness = Some(Witness {
            public_key: key.public_key(),
            signature: Sig::empty(),
        });
        let signature = key.sign(&self.signing_bytes());
        if let Some(w) = self.witness.as_mut() {
            w.signature = signature;
        }
        self
    }

    /// Address of the witness, if signed.
    pub fn signer(&self) -> Option<Hash160> {
        self.witness.as_ref().map(|w| derive_address(&w.public_key))
    }

    /// Sum of input values.
    pub fn input_value(&self) -> Result<i64> {
        self.inputs.iter().try_fold(0i64, |acc, i| {
            acc.checked_add(i.value)
                .ok_or_else(|| Error::invalid_transaction("input value overflow"))
        })
    }

    /// Sum of output values.
    pub fn output_value(&self) -> Result<i64> {
        self.outputs.iter().try_fold(0i64, |acc, o| {
            acc.checked_add(o.value)
                .ok_or_else(|| Error::invalid_transaction("output value overflow"))
        })
    }

    /// `Σ inputs − Σ outputs` for payments, zero for every other kind.
    pub fn fee(&self) -> Result<i64> {
        match self.kind() {
            TxKind::Payment => Ok(self.input_value()? - self.output_value()?),
            _ => Ok(0),
        }
    }

    /// Context-free checks: shape per kind, value signs, witness signature.
    pub fn verify_structure(&self) -> Result<()> {
        if self.outputs.iter().any(|o| o.value < 0) {
            return Err(Error::invalid_transaction("negative output value"));
        }
        if self.inputs.iter().any(|i| i.value < 0) {
            return Err(Error::invalid_transaction("negative input value"));
        }

        match &self.payload {
            TxPayload::Coinbase { .. } => {
                if !self.inputs.is_empty() || self.outputs.len() != 1 {
                    return Err(Error::invalid_transaction(
                        "coinbase must have no inputs and one output",
                    ));
                }
                if self.witness.is_some() {
                    return Err(Error::invalid_transaction("coinbase carries no witness"));
                }
                return Ok(());
            }
            TxPayload::Payment => {
                if self.inputs.is_empty() || self.outputs.is_empty() {
                    return Err(Error::invalid_transaction(
                        "payment needs inputs and outputs",
                    ));
                }
                if self.output_value()? > self.input_value()? {
                    return Err(Error::invalid_transaction("outputs exceed inputs"));
                }
            }
            TxPayload::Register { public_key } => {
                let signed_by = self.witness.as_ref().map(|w| &w.public_key);
                if signed_by != Some(public_key) {
                    return Err(Error::invalid_transaction(
                        "registration must be signed by the registered key",
                    ));
                }
            }
            TxPayload::Revoke { address } => {
                if self.signer() != Some(*address) {
                    return Err(Error::invalid_transaction(
                        "revocation must be signed by the revoked account",
                    ));
                }
            }
            TxPayload::Violation { .. } | TxPayload::Credit { .. } => {}
        }

        if !matches!(self.payload, TxPayload::Payment)
            && (!self.inputs.is_empty() || !self.outputs.is_empty())
        {
            return Err(Error::invalid_transaction(format!(
                "{} transaction cannot move value",
                self.kind()
            )));
        }

        let witness = self
            .witness
            .as_ref()
            .ok_or_else(|| Error::invalid_transaction("missing witness"))?;
        witness
            .public_key
            .verify(&self.signing_bytes(), &witness.signature)
    }
}
