//! Block types for rota.
//!
//! A block carries the transactions its producer packaged during one slot.
//! The header records which slot of which round the block fills, so any node
//! can tell from the chain alone whether a scheduled producer delivered.

use serde::{Deserialize, Serialize};

use crate::address::{derive_address, Hash160};
use crate::crypto::{hash, hash_pair, Hash, PublicKey, SecretKey, Sig};
use crate::error::{Error, Result};
use crate::transaction::{Transaction, TxId, TxKind};

/// Unique identifier for a block (hash of header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub Hash);

impl BlockHash {
    /// The zero block hash (used for genesis parent).
    pub const ZERO: Self = Self(Hash::ZERO);

    pub fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (monotonically increasing).
    pub height: u64,

    /// Hash of parent block header.
    pub prev_hash: BlockHash,

    /// Merkle root of transaction ids in this block.
    pub merkle_root: Hash,

    /// Number of transactions in this block.
    pub tx_count: u32,

    /// Unix millis; the end of the producer's slot.
    pub timestamp: i64,

    /// Start of the round this block was produced in.
    pub period_start_time: i64,

    /// Number of slots in that round.
    pub period_count: u32,

    /// Position of the producer's slot within the round.
    pub slot_index: u32,

    pub producer: PublicKey,

    /// Producer's signature over the header (excluding this field).
    pub signature: Sig,
}

/// Helper for signing (excludes the signature).
#[derive(Serialize)]
struct SignableHeader<'a> {
    height: u64,
    prev_hash: &'a BlockHash,
    merkle_root: &'a Hash,
    tx_count: u32,
    timestamp: i64,
    period_start_time: i64,
    period_count: u32,
    slot_index: u32,
    producer: &'a PublicKey,
}

impl BlockHeader {
    /// Get the bytes to be signed (everything except the signature).
    pub fn signing_bytes(&self) -> Vec<u8> {
        let signable = SignableHeader {
            height: self.height,
            prev_hash: &self.prev_hash,
            merkle_root: &self.merkle_root,
            tx_count: self.tx_count,
            timestamp: self.timestamp,
            period_start_time: self.period_start_time,
            period_count: self.period_count,
            slot_index: self.slot_index,
            producer: &self.producer,
        };
        bincode::serialize(&signable).expect("serialization should not fail")
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash(hash(&self.signing_bytes()))
    }

    /// Address of the producer.
    pub fn producer_address(&self) -> Hash160 {
        derive_address(&self.producer)
    }

    pub fn verify_signature(&self) -> Result<()> {
        self.producer
            .verify(&self.signing_bytes(), &self.signature)
            .map_err(|_| Error::invalid_block("invalid producer signature"))
    }

    /// Validate this header against its parent.
    pub fn validate(&self, parent: Option<&BlockHeader>) -> Result<()> {
        self.verify_signature()?;

        match parent {
            Some(p) => {
                if self.height != p.height + 1 {
                    return Err(Error::invalid_block(format!(
                        "height {} should be {}",
                        self.height,
                        p.height + 1
                    )));
                }
                if self.prev_hash != p.hash() {
                    return Err(Error::invalid_block("parent hash mismatch"));
                }
                if self.timestamp < p.timestamp {
                    return Err(Error::invalid_block("timestamp before parent"));
                }
            }
            None => {
                if self.height != 0 {
                    return Err(Error::invalid_block("genesis must have height 0"));
                }
                if self.prev_hash != BlockHash::ZERO {
                    return Err(Error::invalid_block("genesis must have zero parent"));
                }
            }
        }

        Ok(())
    }
}

/// A complete block with header and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// The coinbase, when present at index 0.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Sum of payment fees in this block.
    pub fn total_fees(&self) -> Result<i64> {
        self.transactions
            .iter()
            .try_fold(0i64, |acc, tx| Ok(acc + tx.fee()?))
    }

    pub fn tx_ids(&self) -> Vec<TxId> {
        self.transactions.iter().map(|tx| tx.id()).collect()
    }

    /// Context-free validation: header, merkle root, coinbase placement and
    /// every transaction's structure and witness.
    pub fn validate(&self, parent: Option<&BlockHeader>) -> Result<()> {
        self.header.validate(parent)?;

        if self.transactions.len() as u32 != self.header.tx_count {
            return Err(Error::invalid_block(format!(
                "tx count mismatch: {} vs {}",
                self.transactions.len(),
                self.header.tx_count
            )));
        }

        if compute_merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(Error::invalid_block("merkle root mismatch"));
        }

        for (i, tx) in self.transactions.iter().enumerate() {
            if tx.kind() == TxKind::Coinbase && i != 0 {
                return Err(Error::invalid_block("coinbase outside index 0"));
            }
            tx.verify_structure()?;
        }

        if self.header.height > 0 && self.coinbase().is_none() {
            return Err(Error::invalid_block("missing coinbase"));
        }

        Ok(())
    }
}

/// Compute the merkle root of a transaction list.
pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return Hash::ZERO;
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(|tx| tx.id().0).collect();

    // Pad to power of 2
    while hashes.len() & (hashes.len() - 1) != 0 {
        let last = hashes[hashes.len() - 1];
        hashes.push(last);
    }

    while hashes.len() > 1 {
        hashes = hashes
            .chunks(2)
            .map(|pair| hash_pair(pair[0], pair[1]))
            .collect();
    }

    hashes[0]
}

/// Builder for creating blocks.
pub struct BlockBuilder {
    parent: Option<BlockHeader>,
    transactions: Vec<Transaction>,
    timestamp: i64,
    period_start_time: i64,
    period_count: u32,
    slot_index: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            parent: None,
            transactions: Vec::new(),
            timestamp: 0,
            period_start_time: 0,
            period_count: 0,
            slot_index: 0,
        }
    }

    /// Set the parent block.
    pub fn parent(mut self, parent: BlockHeader) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn transactions(mut self, transactions: Vec<Transaction>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = millis;
        self
    }

    /// Round metadata: round start, slot count and the producer's slot.
    pub fn period(mut self, period_start_time: i64, period_count: u32, slot_index: u32) -> Self {
        self.period_start_time = period_start_time;
        self.period_count = period_count;
        self.slot_index = slot_index;
        self
    }

    /// Build and sign the block.
    pub fn seal(self, key: &SecretKey) -> Block {
        let (height, prev_hash) = match &self.parent {
            Some(p) => (p.height + 1, p.hash()),
            None => (0, BlockHash::ZERO),
        };

        let header = BlockHeader {
            height,
            prev_hash,
            merkle_root: compute_merkle_root(&self.transactions),
            tx_count: self.transactions.len() as u32,
            timestamp: self.timestamp,
            period_start_time: self.period_start_time,
            period_count: self.period_count,
            slot_index: self.slot_index,
            producer: key.public_key(),
            signature: Sig::empty(),
        };

        let signature = key.sign(&header.signing_bytes());
        Block {
            header: BlockHeader { signature, ..header },
            transactions: self.transactions,
        }
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}
