//! Networking layer for the rota chain.
//!
//! This crate disseminates blocks, transactions and meeting messages:
//! - Length-prefixed bincode framing over any async byte stream
//! - Pull-based inventory gossip (advertise, request, deliver, not found)
//! - A bounded filter that keeps relays from echoing
//! - Per-peer channels with ordered inbound processing and request futures
//!
//! # Architecture
//!
//! 1. **Protocol** (`protocol.rs`) - Message types and the frame codec
//! 2. **Filter** (`filter.rs`) - Recently seen inventory
//! 3. **Peer** (`peer.rs`) - One connection: handshake, pending requests
//! 4. **Network** (`network.rs`) - Peer set, broadcast, readiness
//! 5. **Dispatch** (`dispatch.rs`) - Message processors
//!
//! # Example
//!
//! ```ignore
//! use rota_net::{MessageDispatcher, NetworkConfig, PeerManager};
//!
//! let config = NetworkConfig::builder().chain_id("rota-testnet").build()?;
//! let network = Arc::new(PeerManager::new(config, clock));
//! let dispatcher = Arc::new(MessageDispatcher::new(chain, meeting, network.clone()));
//!
//! let stream = TcpStream::connect("peer1:9000").await?;
//! network.attach(stream, "peer1:9000", dispatcher).await?;
//! ```

pub mod dispatch;
pub mod error;
pub mod filter;
pub mod network;
pub mod peer;
pub mod protocol;

pub use dispatch::MessageDispatcher;
pub use error::NetError;
pub use filter::{InventoryFilter, InventoryFilterConfig};
pub use network::{NetworkConfig, NetworkConfigBuilder, PeerManager};
pub use peer::{MessageHandler, Payload, PeerChannel, PeerId};
pub use protocol::{
    CodecError, InventoryItem, InventoryKind, Message, MessageCodec, ProtocolVersion,
    VerackMessage, VersionMessage,
};
