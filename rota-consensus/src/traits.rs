//! Collaborators the consensus engine calls out to.

use async_trait::async_trait;

use rota_core::{derive_address, Block, ConsensusAccount, Hash160, PublicKey, SecretKey, Transaction};

use crate::message::MeetingMessage;

/// The network as seen by the scheduler and the block producer.
#[async_trait]
pub trait NetworkHandle: Send + Sync {
    /// Enough peers completed the handshake to reach the network.
    fn can_broadcast(&self) -> bool;

    /// The local chain is at least as long as every connected peer's.
    fn is_synced(&self) -> bool;

    /// Advertise a newly committed local block.
    async fn announce_block(&self, block: &Block);

    /// Send a meeting message to every peer.
    async fn broadcast_meeting_message(&self, message: MeetingMessage);
}

/// The local account used for block production.
///
/// Holds the secret key only while unlocked. [`MiningAccount::public_view`]
/// is the only form handed to other subsystems.
#[derive(Debug, Clone)]
pub struct MiningAccount {
    pub address: Hash160,
    pub public_key: PublicKey,
    secret: Option<SecretKey>,
}

impl MiningAccount {
    pub fn unlocked(secret: SecretKey) -> Self {
        let public_key = secret.public_key();
        Self {
            address: derive_address(&public_key),
            public_key,
            secret: Some(secret),
        }
    }

    /// An account whose key material is still encrypted.
    pub fn locked(public_key: PublicKey) -> Self {
        Self {
            address: derive_address(&public_key),
            public_key,
            secret: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.secret.is_none()
    }

    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }

    /// Identity without key material.
    pub fn public_view(&self) -> ConsensusAccount {
        ConsensusAccount {
            address: self.address,
            public_key: self.public_key,
        }
    }
}

/// Source of the local mining account (a wallet, a key file).
pub trait AccountProvider: Send + Sync {
    fn mining_account(&self) -> Option<MiningAccount>;
}

/// Decides whether a packaged payment earns its payer a credit.
pub trait CreditPolicy: Send + Sync {
    /// Credit amount for `tx` packaged at `height`, if any.
    fn credit_for(&self, tx: &Transaction, height: u64) -> Option<u64>;
}

/// Never grants credit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredit;

impl CreditPolicy for NoCredit {
    fn credit_for(&self, _tx: &Transaction, _height: u64) -> Option<u64> {
        None
    }
}
