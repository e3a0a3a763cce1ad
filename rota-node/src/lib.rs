//! Node assembly for the rota chain.
//!
//! ```text
//!                ┌──────────────┐
//!   TOML ──────► │  NodeConfig  │
//!                └──────┬───────┘
//!                       ▼
//!   MemoryStore ─► ConsensusPool ─► ChainState ◄── Mempool
//!                       │               │
//!                       ▼               ▼ on_changed
//!               ConsensusMeeting ◄── PeerManager ◄── MessageDispatcher
//!                       │               ▲
//!                       ▼               │ announce
//!                 MiningService ────────┘
//! ```

pub mod account;
pub mod config;
pub mod error;
pub mod node;

pub use account::NodeAccount;
pub use config::{MeetingSection, MempoolSection, MiningSection, NetworkSection, NodeConfig};
pub use error::NodeError;
pub use node::{create_genesis, load_genesis, write_genesis, Node};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
