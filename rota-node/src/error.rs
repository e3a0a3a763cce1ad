//! Node start-up errors.

use rota_chain::ChainError;
use rota_consensus::MiningError;
use rota_net::NetError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid genesis: {0}")]
    Genesis(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rota_core::Error),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("mining error: {0}")]
    Mining(#[from] MiningError),
}
