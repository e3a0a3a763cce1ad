//! Rota Core - Fundamental types for the rota slot-scheduled chain.
//!
//! Registered consensus accounts take turns producing blocks in round-robin
//! time slots. This crate holds the data every other layer agrees on:
//!
//! - [`crypto`] - Hashing (BLAKE3) and signatures (Ed25519)
//! - [`address`] - 20-byte account addresses and consensus accounts
//! - [`transaction`] - Transactions as a tagged union over their kinds
//! - [`block`] - Blocks, headers with round metadata, merkle roots
//! - [`evidence`] - Content-addressed proofs of producer misbehavior
//! - [`params`] - Consensus constants (slot length, rewards, maturity)
//! - [`time`] - Network-adjusted clock
//!
//! # Example
//!
//! ```rust
//! use rota_core::{BlockBuilder, SecretKey, Transaction};
//!
//! let key = SecretKey::generate();
//! let genesis = BlockBuilder::new()
//!     .transactions(vec![Transaction::register(&key, 0)])
//!     .timestamp(0)
//!     .seal(&key);
//!
//! assert!(genesis.validate(None).is_ok());
//! ```

pub mod address;
pub mod block;
pub mod crypto;
pub mod error;
pub mod evidence;
pub mod params;
pub mod time;
pub mod transaction;

#[cfg(test)]
mod proptest;

pub use address::{derive_address, ConsensusAccount, Hash160};
pub use block::{compute_merkle_root, Block, BlockBuilder, BlockHash, BlockHeader};
pub use crypto::{hash, hash_all, hash_pair, Hash, PublicKey, SecretKey, Sig};
pub use error::{Error, ErrorCode, Result};
pub use evidence::{EvidenceId, NotBroadcastEvidence, ViolationEvidence, ViolationKind};
pub use params::ChainParams;
pub use time::{MockClock, NetworkClock, TimeSource};
pub use transaction::{
    OutPoint, Transaction, TxId, TxInput, TxKind, TxOutput, TxPayload, Witness,
};
