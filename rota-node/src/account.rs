//! The node's producing account.
//!
//! The key comes either inline from `mining.key` or from the file named by
//! `mining.key_file`, which holds the same hex-encoded 32-byte seed. A key
//! file that does not exist yet leaves the account unavailable; the mining
//! service keeps polling and picks the key up once the file appears.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use rota_consensus::{AccountProvider, MiningAccount};
use rota_core::{derive_address, SecretKey};

use crate::config::NodeConfig;
use crate::error::NodeError;

/// Decode a hex-encoded 32-byte Ed25519 seed. `field` names the source in errors.
pub fn decode_seed(encoded: &str, field: &str) -> Result<SecretKey, NodeError> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| NodeError::Config(format!("{field}: {e}")))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| NodeError::Config(format!("{field} must be 32 bytes")))?;
    Ok(SecretKey::from_bytes(&seed))
}

#[derive(Debug, Clone)]
enum KeySource {
    Inline(SecretKey),
    File(PathBuf),
}

/// Account provider backed by the node configuration.
pub struct NodeAccount {
    source: KeySource,
    loaded: RwLock<Option<MiningAccount>>,
}

impl NodeAccount {
    pub fn from_key(key: SecretKey) -> Self {
        Self {
            loaded: RwLock::new(Some(MiningAccount::unlocked(key.clone()))),
            source: KeySource::Inline(key),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: KeySource::File(path.into()),
            loaded: RwLock::new(None),
        }
    }

    /// The configured account, or `None` when mining is disabled.
    pub fn from_config(config: &NodeConfig) -> Result<Option<Self>, NodeError> {
        if !config.mining.enabled {
            return Ok(None);
        }
        if let Some(key) = config.mining_key()? {
            return Ok(Some(Self::from_key(key)));
        }
        match &config.mining.key_file {
            Some(path) => Ok(Some(Self::from_file(path))),
            None => Err(NodeError::Config(
                "mining.enabled requires mining.key or mining.key_file".into(),
            )),
        }
    }

    /// Read the key file.
    pub fn load_file(path: &Path) -> Result<SecretKey, NodeError> {
        let text = std::fs::read_to_string(path)?;
        decode_seed(&text, &format!("key file {}", path.display()))
    }

    fn load(&self) -> Result<MiningAccount, NodeError> {
        let key = match &self.source {
            KeySource::Inline(key) => key.clone(),
            KeySource::File(path) => Self::load_file(path)?,
        };
        Ok(MiningAccount::unlocked(key))
    }
}

impl AccountProvider for NodeAccount {
    fn mining_account(&self) -> Option<MiningAccount> {
        if let Some(account) = self.loaded.read().clone() {
            return Some(account);
        }
        match self.load() {
            Ok(account) => {
                info!(address = %account.address, "Mining key loaded");
                *self.loaded.write() = Some(account.clone());
                Some(account)
            }
            Err(e) => {
                debug!(error = %e, "Mining key unavailable");
                None
            }
        }
    }
}

impl std::fmt::Debug for NodeAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            KeySource::Inline(key) => format!("inline {}", derive_address(&key.public_key())),
            KeySource::File(path) => format!("file {}", path.display()),
        };
        f.debug_struct("NodeAccount").field("source", &source).finish()
    }
}
