//! Node configuration file.
//!
//! ```toml
//! log_level = "info"
//! listen_addr = "0.0.0.0:9333"
//! peers = ["10.0.0.2:9333"]
//! genesis_path = "genesis.hex"
//!
//! [chain]
//! chain_id = "rota-testnet"
//! time_period = 10000      # millis
//! block_gen_time = 6000    # millis
//!
//! [network]
//! min_broadcast_peers = 2
//!
//! [mining]
//! enabled = true
//! key_file = "mining.key"  # or key = "<64 hex chars>"
//! ```
//!
//! Every field is optional. Durations are milliseconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rota_chain::MempoolConfig;
use rota_consensus::{MeetingConfig, MiningConfig};
use rota_core::{ChainParams, SecretKey};
use rota_net::{NetworkConfig, NetworkConfigBuilder};

use crate::account::decode_seed;
use crate::error::NodeError;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default log filter; `RUST_LOG` takes precedence.
    pub log_level: String,
    pub listen_addr: SocketAddr,
    /// Peers dialed at start-up.
    pub peers: Vec<String>,
    /// Hex-encoded genesis block.
    pub genesis_path: PathBuf,
    pub chain: ChainParams,
    pub network: NetworkSection,
    pub mempool: MempoolSection,
    pub meeting: MeetingSection,
    pub mining: MiningSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9333)),
            peers: Vec::new(),
            genesis_path: PathBuf::from("genesis.hex"),
            chain: ChainParams::default(),
            network: NetworkSection::default(),
            mempool: MempoolSection::default(),
            meeting: MeetingSection::default(),
            mining: MiningSection::default(),
        }
    }
}

/// `[network]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub max_peers: usize,
    pub min_broadcast_peers: usize,
    #[serde(with = "duration_millis")]
    pub block_download_timeout: Duration,
    pub max_violations: u32,
    pub filter_capacity: usize,
    pub max_message_size: usize,
    #[serde(with = "duration_millis")]
    pub ping_interval: Duration,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let defaults = NetworkConfig::default();
        Self {
            max_peers: defaults.max_peers,
            min_broadcast_peers: defaults.min_broadcast_peers,
            block_download_timeout: defaults.block_download_timeout,
            max_violations: defaults.max_violations,
            filter_capacity: defaults.filter_capacity,
            max_message_size: defaults.max_message_size,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// `[mempool]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    pub max_size: usize,
    pub ttl_secs: i64,
    pub max_tx_size: usize,
}

impl Default for MempoolSection {
    fn default() -> Self {
        let defaults = MempoolConfig::default();
        Self {
            max_size: defaults.max_size,
            ttl_secs: defaults.ttl.num_seconds(),
            max_tx_size: defaults.max_tx_size,
        }
    }
}

/// `[meeting]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingSection {
    pub stale_after_rounds: i64,
    pub message_cache_size: usize,
}

impl Default for MeetingSection {
    fn default() -> Self {
        let defaults = MeetingConfig::default();
        Self {
            stale_after_rounds: defaults.stale_after_rounds,
            message_cache_size: defaults.message_cache_size,
        }
    }
}

/// `[mining]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSection {
    pub enabled: bool,
    /// Hex-encoded 32-byte Ed25519 seed of the producing account.
    pub key: Option<String>,
    /// File holding the same seed; read when `key` is unset.
    pub key_file: Option<PathBuf>,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub readiness_poll: Duration,
}

impl Default for MiningSection {
    fn default() -> Self {
        let defaults = MiningConfig::default();
        Self {
            enabled: false,
            key: None,
            key_file: None,
            poll_interval: defaults.poll_interval,
            readiness_poll: defaults.readiness_poll,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

impl NodeConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, NodeError> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let chain = &self.chain;
        if chain.chain_id.is_empty() {
            return Err(NodeError::Config("chain.chain_id must not be empty".into()));
        }
        if chain.time_period.is_zero() {
            return Err(NodeError::Config("chain.time_period must be positive".into()));
        }
        if chain.block_gen_time.is_zero() {
            return Err(NodeError::Config("chain.block_gen_time must be positive".into()));
        }
        if chain.block_gen_time > chain.time_period {
            return Err(NodeError::Config(format!(
                "chain.block_gen_time ({:?}) exceeds chain.time_period ({:?})",
                chain.block_gen_time, chain.time_period
            )));
        }
        if self.network.min_broadcast_peers > self.network.max_peers {
            return Err(NodeError::Config(
                "network.min_broadcast_peers exceeds network.max_peers".into(),
            ));
        }
        if self.mempool.ttl_secs <= 0 {
            return Err(NodeError::Config("mempool.ttl_secs must be positive".into()));
        }
        if self.mining.key.is_some() && self.mining.key_file.is_some() {
            return Err(NodeError::Config(
                "set only one of mining.key and mining.key_file".into(),
            ));
        }
        if self.mining.enabled && self.mining.key.is_none() && self.mining.key_file.is_none() {
            return Err(NodeError::Config(
                "mining.enabled requires mining.key or mining.key_file".into(),
            ));
        }
        self.mining_key()?;
        Ok(())
    }

    pub fn network_config(&self) -> Result<NetworkConfig, NodeError> {
        let n = &self.network;
        let config = NetworkConfigBuilder::default()
            .chain_id(self.chain.chain_id.clone())
            .max_peers(n.max_peers)
            .min_broadcast_peers(n.min_broadcast_peers)
            .block_download_timeout(n.block_download_timeout)
            .max_violations(n.max_violations)
            .filter_capacity(n.filter_capacity)
            .max_message_size(n.max_message_size)
            .build()?;
        Ok(config)
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            max_size: self.mempool.max_size,
            ttl: chrono::Duration::seconds(self.mempool.ttl_secs),
            max_tx_size: self.mempool.max_tx_size,
        }
    }

    pub fn meeting_config(&self) -> MeetingConfig {
        MeetingConfig {
            stale_after_rounds: self.meeting.stale_after_rounds,
            message_cache_size: self.meeting.message_cache_size,
        }
    }

    pub fn mining_config(&self) -> MiningConfig {
        MiningConfig {
            poll_interval: self.mining.poll_interval,
            readiness_poll: self.mining.readiness_poll,
        }
    }

    /// The inline producing key, if one is configured.
    pub fn mining_key(&self) -> Result<Option<SecretKey>, NodeError> {
        self.mining
            .key
            .as_deref()
            .map(|encoded| decode_seed(encoded, "mining.key"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.chain, ChainParams::default());
        assert_eq!(config.network.max_peers, 50);
        assert!(!config.mining.enabled);
        assert!(config.mining_key().unwrap().is_none());
    }

    #[test]
    fn test_sections_and_millis() {
        let key = SecretKey::generate();
        let text = format!(
            r#"
            log_level = "debug"
            peers = ["127.0.0.1:9000"]

            [chain]
            chain_id = "rota-testnet"
            time_period = 4000
            block_gen_time = 2500

            [network]
            min_broadcast_peers = 2
            block_download_timeout = 1500

            [mining]
            enabled = true
            key = "{}"
            "#,
            hex::encode(key.as_bytes())
        );
        let config = NodeConfig::from_toml_str(&text).unwrap();

        assert_eq!(config.peers, vec!["127.0.0.1:9000".to_string()]);
        assert_eq!(config.chain.time_period, Duration::from_millis(4000));
        assert_eq!(config.chain.block_gen_time, Duration::from_millis(2500));
        assert_eq!(config.chain.mining_mature_count, 10);

        let network = config.network_config().unwrap();
        assert_eq!(network.chain_id, "rota-testnet");
        assert_eq!(network.min_broadcast_peers, 2);
        assert_eq!(network.block_download_timeout, Duration::from_millis(1500));

        let loaded = config.mining_key().unwrap().unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn test_rejects_bad_timing() {
        let zero_slot = "[chain]\ntime_period = 0\n";
        assert!(matches!(
            NodeConfig::from_toml_str(zero_slot),
            Err(NodeError::Config(_))
        ));

        let zero_gen = "[chain]\nblock_gen_time = 0\n";
        assert!(matches!(
            NodeConfig::from_toml_str(zero_gen),
            Err(NodeError::Config(_))
        ));

        let gen_too_long = "[chain]\ntime_period = 1000\nblock_gen_time = 1001\n";
        assert!(matches!(
            NodeConfig::from_toml_str(gen_too_long),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_mining_without_usable_key() {
        let no_key = "[mining]\nenabled = true\n";
        assert!(NodeConfig::from_toml_str(no_key).is_err());

        let short_key = "[mining]\nkey = \"abcd\"\n";
        assert!(NodeConfig::from_toml_str(short_key).is_err());

        let not_hex = format!("[mining]\nkey = \"{}\"\n", "zz".repeat(32));
        assert!(NodeConfig::from_toml_str(&not_hex).is_err());

        let both = format!(
            "[mining]\nkey = \"{}\"\nkey_file = \"mining.key\"\n",
            "ab".repeat(32)
        );
        assert!(NodeConfig::from_toml_str(&both).is_err());

        let from_file = "[mining]\nenabled = true\nkey_file = \"mining.key\"\n";
        let config = NodeConfig::from_toml_str(from_file).unwrap();
        assert_eq!(config.mining.key_file, Some(PathBuf::from("mining.key")));
        assert!(config.mining_key().unwrap().is_none());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            NodeConfig::from_toml_str("[chain\n"),
            Err(NodeError::Toml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"127.0.0.1:7000\"").unwrap();
        writeln!(file, "[mempool]\nmax_size = 10").unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.mempool_config().max_size, 10);

        assert!(matches!(
            NodeConfig::load(file.path().with_extension("missing")),
            Err(NodeError::Io(_))
        ));
    }
}
