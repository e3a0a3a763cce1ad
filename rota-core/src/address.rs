//! Account addresses.
//!
//! An address is the 20-byte prefix of the BLAKE3 hash of an Ed25519 public
//! key. Consensus accounts pair an address with the key it was derived from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash, PublicKey};
use crate::error::{Error, Result};

/// A 20-byte account address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash160([u8; 20]);

impl Hash160 {
    pub const ZERO: Self = Self([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Create from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(Error::invalid_hash(format!(
                "expected 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash160({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash160 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Derive the address owned by a public key.
pub fn derive_address(public_key: &PublicKey) -> Hash160 {
    let digest = hash(&public_key.as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    Hash160(out)
}

/// A registered block producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusAccount {
    pub address: Hash160,
    pub public_key: PublicKey,
}

impl ConsensusAccount {
    /// Build an account whose address is derived from `public_key`.
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            address: derive_address(&public_key),
            public_key,
        }
    }

    /// Whether the address really belongs to the key.
    pub fn is_consistent(&self) -> bool {
        derive_address(&self.public_key) == self.address
    }
}
