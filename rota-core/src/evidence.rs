//! Violation evidence.
//!
//! Evidence proves that a scheduled producer failed its duty. Each instance
//! has a canonical byte form `kind || target || payload` and its BLAKE3 hash
//! (the [`EvidenceId`]) is the key under which filed evidence is persisted,
//! so an infraction is penalized at most once.

use serde::{Deserialize, Serialize};

use crate::address::Hash160;
use crate::crypto::{hash, Hash};
use crate::error::{Error, Result};

/// Content hash of a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvidenceId(pub Hash);

impl std::fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant of an evidence kind, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ViolationKind {
    /// A producer held a slot and never broadcast a block.
    NotBroadcast = 1,
}

impl TryFrom<u8> for ViolationKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ViolationKind::NotBroadcast),
            other => Err(Error::invalid_transaction(format!(
                "unknown evidence kind {other}"
            ))),
        }
    }
}

/// A producer that did not broadcast during its slot of the round starting at
/// `period_start_time` (unix millis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotBroadcastEvidence {
    pub address: Hash160,
    pub period_start_time: i64,
}

/// Proof that a producer misbehaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationEvidence {
    NotBroadcast(NotBroadcastEvidence),
}

impl ViolationEvidence {
    /// Evidence that `address` missed its slot in the round starting at `period_start_time`.
    pub fn not_broadcast(address: Hash160, period_start_time: i64) -> Self {
        ViolationEvidence::NotBroadcast(NotBroadcastEvidence {
            address,
            period_start_time,
        })
    }

    pub fn kind(&self) -> ViolationKind {
        match self {
            ViolationEvidence::NotBroadcast(_) => ViolationKind::NotBroadcast,
        }
    }

    /// The producer being accused.
    pub fn target(&self) -> Hash160 {
        match self {
            ViolationEvidence::NotBroadcast(e) => e.address,
        }
    }

    /// Kind-specific payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            ViolationEvidence::NotBroadcast(e) => e.period_start_time.to_be_bytes().to_vec(),
        }
    }

    /// Canonical encoding: kind byte, 20-byte target, payload.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(1 + 20 + payload.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(self.target().as_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode the canonical encoding.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let (&kind, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::invalid_transaction("empty evidence"))?;
        if rest.len() < 20 {
            return Err(Error::invalid_transaction("evidence target truncated"));
        }
        let mut target = [0u8; 20];
        target.copy_from_slice(&rest[..20]);
        let payload = &rest[20..];

        match ViolationKind::try_from(kind)? {
            ViolationKind::NotBroadcast => {
                let raw: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| Error::invalid_transaction("bad not-broadcast payload"))?;
                Ok(Self::not_broadcast(
                    Hash160::from_bytes(target),
                    i64::from_be_bytes(raw),
                ))
            }
        }
    }

    /// Idempotency key.
    pub fn id(&self) -> EvidenceId {
        EvidenceId(hash(&self.canonical_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Hash160 {
        Hash160::from_bytes([b; 20])
    }

    #[test]
    fn test_same_content_same_id() {
        let a = ViolationEvidence::not_broadcast(addr(1), 1_000);
        let b = ViolationEvidence::not_broadcast(addr(1), 1_000);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_id_covers_target_and_round() {
        let base = ViolationEvidence::not_broadcast(addr(1), 1_000);
        assert_ne!(base.id(), ViolationEvidence::not_broadcast(addr(2), 1_000).id());
        assert_ne!(base.id(), ViolationEvidence::not_broadcast(addr(1), 2_000).id());
    }

    #[test]
    fn test_canonical_layout() {
        let ev = ViolationEvidence::not_broadcast(addr(9), 42);
        let bytes = ev.canonical_bytes();
        assert_eq!(bytes.len(), 29);
        assert_eq!(bytes[0], ViolationKind::NotBroadcast as u8);
        assert_eq!(&bytes[1..21], addr(9).as_bytes());
        assert_eq!(ViolationEvidence::from_canonical_bytes(&bytes).unwrap(), ev);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ViolationEvidence::from_canonical_bytes(&[]).is_err());
        assert!(ViolationEvidence::from_canonical_bytes(&[9; 29]).is_err());
        assert!(ViolationEvidence::from_canonical_bytes(&[1; 10]).is_err());
    }
}
