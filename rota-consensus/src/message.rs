//! Meeting messages exchanged between consensus participants.

use serde::{Deserialize, Serialize};

use rota_core::{
    derive_address, hash, ConsensusAccount, Error, Hash, Hash160, Result, SecretKey, Witness,
};

/// What a meeting message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingKind {
    /// Ask peers for their view of the current round. Doubles as the
    /// sender's readiness announcement.
    PullState,
    /// A participant's view of the current round.
    RoundState {
        period_start_time: i64,
        /// Slot length in milliseconds.
        time_period: i64,
        /// Slot holders in slot order.
        members: Vec<ConsensusAccount>,
    },
}

/// A consensus meeting message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingMessage {
    /// Address of the participant that produced the message.
    pub sender: Hash160,
    /// Sender's best height when the message was produced.
    pub height: u64,
    pub kind: MeetingKind,
    pub timestamp: i64,
    pub witness: Option<Witness>,
}

#[derive(Serialize)]
struct SignableMessage<'a> {
    sender: &'a Hash160,
    height: u64,
    kind: &'a MeetingKind,
    timestamp: i64,
}

impl MeetingMessage {
    pub fn pull_state(sender: Hash160, height: u64, timestamp: i64) -> Self {
        Self {
            sender,
            height,
            kind: MeetingKind::PullState,
            timestamp,
            witness: None,
        }
    }

    pub fn round_state(
        sender: Hash160,
        height: u64,
        period_start_time: i64,
        time_period: i64,
        members: Vec<ConsensusAccount>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender,
            height,
            kind: MeetingKind::RoundState {
                period_start_time,
                time_period,
                members,
            },
            timestamp,
            witness: None,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let signable = SignableMessage {
            sender: &self.sender,
            height: self.height,
            kind: &self.kind,
            timestamp: self.timestamp,
        };
        bincode::serialize(&signable).expect("serialization should not fail")
    }

    pub fn sign(mut self, key: &SecretKey) -> Self {
        let signature = key.sign(&self.signing_bytes());
        self.witness = Some(Witness {
            public_key: key.public_key(),
            signature,
        });
        self
    }

    /// Content hash, covering the witness.
    pub fn hash(&self) -> Hash {
        hash(&bincode::serialize(self).expect("serialization should not fail"))
    }

    pub fn is_signed(&self) -> bool {
        self.witness.is_some()
    }

    /// Check the witness belongs to `sender` and signs the message.
    pub fn verify(&self) -> Result<()> {
        let witness = self.witness.as_ref().ok_or_else(Error::invalid_signature)?;
        if derive_address(&witness.public_key) != self.sender {
            return Err(Error::invalid_key("witness key does not match sender"));
        }
        witness
            .public_key
            .verify(&self.signing_bytes(), &witness.signature)
    }
}
