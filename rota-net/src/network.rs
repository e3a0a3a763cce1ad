//! Peer set management and broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use rota_chain::BlockChangedListener;
use rota_consensus::{MeetingMessage, NetworkHandle};
use rota_core::{Block, BlockHash, NetworkClock};

use crate::error::NetError;
use crate::filter::{InventoryFilter, InventoryFilterConfig};
use crate::peer::{MessageHandler, PeerChannel, PeerId};
use crate::protocol::{InventoryItem, Message, MessageCodec};

/// Network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Chain ID for network separation.
    pub chain_id: String,
    /// Maximum number of connected peers.
    pub max_peers: usize,
    /// Handshaken peers needed before the node may broadcast.
    pub min_broadcast_peers: usize,
    /// Bound on waiting for a requested block.
    pub block_download_timeout: Duration,
    /// Protocol violations tolerated before a peer is dropped.
    pub max_violations: u32,
    /// Inventory filter capacity.
    pub filter_capacity: usize,
    pub max_message_size: usize,
}

impl NetworkConfig {
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::default()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chain_id: "rota-local".to_string(),
            max_peers: 50,
            min_broadcast_peers: 1,
            block_download_timeout: Duration::from_secs(60),
            max_violations: 10,
            filter_capacity: InventoryFilterConfig::default().capacity,
            max_message_size: MessageCodec::DEFAULT_MAX_SIZE,
        }
    }
}

/// Builder for NetworkConfig.
#[derive(Debug, Default)]
pub struct NetworkConfigBuilder {
    chain_id: Option<String>,
    max_peers: Option<usize>,
    min_broadcast_peers: Option<usize>,
    block_download_timeout: Option<Duration>,
    max_violations: Option<u32>,
    filter_capacity: Option<usize>,
    max_message_size: Option<usize>,
}

impl NetworkConfigBuilder {
    pub fn chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }

    pub fn max_peers(mut self, max: usize) -> Self {
        self.max_peers = Some(max);
        self
    }

    pub fn min_broadcast_peers(mut self, min: usize) -> Self {
        self.min_broadcast_peers = Some(min);
        self
    }

    pub fn block_download_timeout(mut self, timeout: Duration) -> Self {
        self.block_download_timeout = Some(timeout);
        self
    }

    pub fn max_violations(mut self, max: u32) -> Self {
        self.max_violations = Some(max);
        self
    }

    pub fn filter_capacity(mut self, capacity: usize) -> Self {
        self.filter_capacity = Some(capacity);
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Build the config.
    pub fn build(self) -> Result<NetworkConfig, NetError> {
        let defaults = NetworkConfig::default();
        let config = NetworkConfig {
            chain_id: self
                .chain_id
                .ok_or_else(|| NetError::Config("chain_id is required".into()))?,
            max_peers: self.max_peers.unwrap_or(defaults.max_peers),
            min_broadcast_peers: self
                .min_broadcast_peers
                .unwrap_or(defaults.min_broadcast_peers),
            block_download_timeout: self
                .block_download_timeout
                .unwrap_or(defaults.block_download_timeout),
            max_violations: self.max_violations.unwrap_or(defaults.max_violations),
            filter_capacity: self.filter_capacity.unwrap_or(defaults.filter_capacity),
            max_message_size: self.max_message_size.unwrap_or(defaults.max_message_size),
        };
        if config.max_violations == 0 {
            return Err(NetError::Config("max_violations must be positive".into()));
        }
        if config.filter_capacity == 0 {
            return Err(NetError::Config("filter_capacity must be positive".into()));
        }
        Ok(config)
    }
}

/// The set of connected peers, shared by every subsystem that talks to the
/// network.
pub struct PeerManager {
    config: NetworkConfig,
    codec: MessageCodec,
    clock: Arc<NetworkClock>,
    filter: Arc<InventoryFilter>,
    peers: RwLock<HashMap<PeerId, Arc<PeerChannel>>>,
    next_id: AtomicU64,
    local_height: AtomicU64,
}

impl PeerManager {
    pub fn new(config: NetworkConfig, clock: Arc<NetworkClock>) -> Self {
        let codec = MessageCodec::with_max_size(config.max_message_size);
        let filter = Arc::new(InventoryFilter::with_capacity(config.filter_capacity));
        Self {
            config,
            codec,
            clock,
            filter,
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            local_height: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<NetworkClock> {
        &self.clock
    }

    pub fn filter(&self) -> &Arc<InventoryFilter> {
        &self.filter
    }

    pub fn local_height(&self) -> u64 {
        self.local_height.load(Ordering::SeqCst)
    }

    pub fn set_local_height(&self, height: u64) {
        self.local_height.store(height, Ordering::SeqCst);
    }

    /// Register a new peer. The returned receiver yields its outbound
    /// messages.
    pub fn add_peer(
        &self,
        label: impl Into<String>,
    ) -> Result<(Arc<PeerChannel>, tokio::sync::mpsc::UnboundedReceiver<Message>), NetError> {
        let mut peers = self.peers.write();
        if peers.len() >= self.config.max_peers {
            return Err(NetError::TooManyPeers);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (peer, outbound) = PeerChannel::new(id, label);
        peers.insert(id, peer.clone());
        info!(peer = id, label = %peer.label(), "Peer connected");
        Ok((peer, outbound))
    }

    /// Disconnect a peer, failing its outstanding requests.
    pub fn remove_peer(&self, id: PeerId) -> Option<Arc<PeerChannel>> {
        let peer = self.peers.write().remove(&id)?;
        peer.close();
        info!(peer = id, label = %peer.label(), "Peer disconnected");
        Some(peer)
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<PeerChannel>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<PeerChannel>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn handshaken_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_handshake_done())
            .count()
    }

    /// Send to one peer.
    pub fn send(&self, id: PeerId, message: Message) -> Result<(), NetError> {
        self.peer(id).ok_or(NetError::PeerNotFound(id))?.send(message)
    }

    /// Send to every handshaken peer except `exclude`. Returns the number of
    /// peers reached.
    pub fn broadcast(&self, message: Message, exclude: Option<PeerId>) -> usize {
        let targets: Vec<_> = self
            .peers()
            .into_iter()
            .filter(|p| p.is_handshake_done() && Some(p.id()) != exclude)
            .collect();
        targets
            .iter()
            .filter(|p| p.send(message.clone()).is_ok())
            .count()
    }

    /// Advertise `item` unless it was already seen. Returns `true` if the
    /// advertisement went out.
    pub fn advertise(&self, item: InventoryItem, exclude: Option<PeerId>) -> bool {
        if !self.filter.insert(item.hash) {
            return false;
        }
        let reached = self.broadcast(Message::Inventory(vec![item]), exclude);
        debug!(kind = ?item.kind, hash = %item.hash, reached, "Advertised inventory");
        true
    }

    /// Ping every handshaken peer.
    pub fn ping_all(&self) -> usize {
        self.peers()
            .iter()
            .filter(|p| p.is_handshake_done() && p.ping().is_ok())
            .count()
    }

    /// Run a byte stream as a peer connection: frames are decoded into the
    /// ordered inbound task and the outbound queue is encoded onto the stream.
    pub async fn attach<T>(
        self: &Arc<Self>,
        stream: T,
        label: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<PeerChannel>, NetError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (peer, mut outbound) = self.add_peer(label)?;
        let inbound = peer.spawn_inbound(handler.clone(), self.config.max_violations);
        let (mut reader, mut writer) = tokio::io::split(stream);

        let codec = self.codec.clone();
        let id = peer.id();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = codec.write_frame(&mut writer, &message).await {
                    debug!(peer = id, error = %e, "Write failed");
                    break;
                }
            }
        });

        let codec = self.codec.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match codec.read_frame(&mut reader).await {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = id, error = %e, "Read failed");
                        break;
                    }
                }
            }
            manager.remove_peer(id);
        });

        handler.connected(&peer).await?;
        Ok(peer)
    }
}

#[async_trait]
impl NetworkHandle for PeerManager {
    fn can_broadcast(&self) -> bool {
        self.handshaken_count() >= self.config.min_broadcast_peers
    }

    fn is_synced(&self) -> bool {
        let local = self.local_height();
        self.peers
            .read()
            .values()
            .filter(|p| p.is_handshake_done())
            .all(|p| p.best_height() <= local)
    }

    async fn announce_block(&self, block: &Block) {
        self.local_height.fetch_max(block.height(), Ordering::SeqCst);
        self.advertise(InventoryItem::new_block(block.hash()), None);
    }

    async fn broadcast_meeting_message(&self, message: MeetingMessage) {
        self.advertise(InventoryItem::consensus(message.hash()), None);
    }
}

impl BlockChangedListener for PeerManager {
    fn on_changed(&self, _old_height: u64, new_height: u64, _old_hash: BlockHash, _new_hash: BlockHash) {
        self.set_local_height(new_height);
    }
}
