//! Network error types.

use rota_chain::ChainError;
use rota_core::Hash;

use crate::peer::PeerId;
use crate::protocol::CodecError;

/// Networking errors.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("peer disconnected")]
    Disconnected,

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("too many peers")]
    TooManyPeers,

    #[error("request for {0} timed out")]
    Timeout(Hash),

    #[error("peer does not have {0}")]
    NotFound(Hash),

    #[error("request for {0} already pending")]
    AlreadyRequested(Hash),

    /// The peer broke the protocol; counted against it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Storage(#[from] rota_core::Error),
}

impl NetError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, NetError::Protocol(_))
    }
}
