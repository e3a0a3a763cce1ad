//! One logical connection to a peer.
//!
//! A [`PeerChannel`] owns:
//! - The outbound queue drained by the transport writer
//! - Handshake state and the clock offset learned from it
//! - Outstanding single-item data requests, keyed by content hash
//! - An inbound task that hands messages to a [`MessageHandler`] strictly in
//!   arrival order
//!
//! Closing the channel fails every outstanding request with
//! [`NetError::Disconnected`] instead of leaving its waiter hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rota_consensus::MeetingMessage;
use rota_core::{Block, BlockHash, Hash, Transaction};

use crate::error::NetError;
use crate::protocol::{InventoryItem, InventoryKind, Message};

/// Locally assigned peer identifier.
pub type PeerId = u64;

/// An object delivered in answer to a data request.
#[derive(Debug, Clone)]
pub enum Payload {
    Block(Block),
    Transaction(Transaction),
    Consensus(MeetingMessage),
}

impl Payload {
    pub fn hash(&self) -> Hash {
        match self {
            Payload::Block(block) => block.hash().0,
            Payload::Transaction(tx) => tx.id().0,
            Payload::Consensus(message) => message.hash(),
        }
    }

    fn answers(&self, kind: InventoryKind) -> bool {
        matches!(
            (self, kind),
            (Payload::Block(_), InventoryKind::Block | InventoryKind::NewBlock)
                | (Payload::Transaction(_), InventoryKind::Transaction)
                | (Payload::Consensus(_), InventoryKind::Consensus)
        )
    }
}

type Responder = oneshot::Sender<Result<Payload, NetError>>;

/// Processes inbound messages for a peer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once when the peer is attached, before any inbound message.
    async fn connected(&self, _peer: &Arc<PeerChannel>) -> Result<(), NetError> {
        Ok(())
    }

    async fn handle(&self, peer: &Arc<PeerChannel>, message: Message) -> Result<(), NetError>;
}

/// A connected peer.
pub struct PeerChannel {
    id: PeerId,
    label: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    version_sent: AtomicBool,
    verack_sent: AtomicBool,
    handshake_done: AtomicBool,
    best_height: AtomicU64,
    clock_offset: AtomicI64,
    violations: AtomicU32,
    ping_nonce: Mutex<Option<u64>>,
    pending: Mutex<HashMap<Hash, (InventoryKind, Responder)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("handshake_done", &self.is_handshake_done())
            .field("best_height", &self.best_height())
            .finish()
    }
}

impl PeerChannel {
    /// Create a channel and the receiving end of its outbound queue.
    pub fn new(id: PeerId, label: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            label: label.into(),
            outbound: Mutex::new(Some(tx)),
            version_sent: AtomicBool::new(false),
            verack_sent: AtomicBool::new(false),
            handshake_done: AtomicBool::new(false),
            best_height: AtomicU64::new(0),
            clock_offset: AtomicI64::new(0),
            violations: AtomicU32::new(0),
            ping_nonce: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        (peer, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue a message for the peer.
    pub fn send(&self, message: Message) -> Result<(), NetError> {
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(NetError::Disconnected)?;
        sender.send(message).map_err(|_| NetError::Disconnected)
    }

    // === Handshake ===

    /// Returns `true` the first time only.
    pub fn mark_version_sent(&self) -> bool {
        !self.version_sent.swap(true, Ordering::SeqCst)
    }

    /// Returns `true` the first time only.
    pub fn mark_verack_sent(&self) -> bool {
        !self.verack_sent.swap(true, Ordering::SeqCst)
    }

    /// Record the handshake acknowledgement. Returns `false` if the handshake
    /// was already complete.
    pub fn complete_handshake(&self, clock_offset: i64) -> bool {
        if self.handshake_done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.clock_offset.store(clock_offset, Ordering::SeqCst);
        true
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::SeqCst)
    }

    /// Peer time minus local time, in millis.
    pub fn clock_offset(&self) -> i64 {
        self.clock_offset.load(Ordering::SeqCst)
    }

    // === Bookkeeping ===

    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::SeqCst)
    }

    /// Raise the peer's known best height; never lowers it.
    pub fn set_best_height(&self, height: u64) {
        self.best_height.fetch_max(height, Ordering::SeqCst);
    }

    /// Count a protocol violation, returning the new total.
    pub fn record_violation(&self) -> u32 {
        self.violations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    /// Send a ping with a fresh random nonce.
    pub fn ping(&self) -> Result<u64, NetError> {
        let nonce = rand::random::<u64>();
        *self.ping_nonce.lock() = Some(nonce);
        self.send(Message::Ping(nonce))?;
        Ok(nonce)
    }

    /// Whether `nonce` answers the outstanding ping.
    pub fn check_pong(&self, nonce: u64) -> bool {
        let mut expected = self.ping_nonce.lock();
        if *expected == Some(nonce) {
            *expected = None;
            return true;
        }
        false
    }

    // === Requests ===

    /// Request a single item and get a receiver for its delivery.
    pub fn request(
        &self,
        item: InventoryItem,
    ) -> Result<oneshot::Receiver<Result<Payload, NetError>>, NetError> {
        if self.is_closed() {
            return Err(NetError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&item.hash) {
                return Err(NetError::AlreadyRequested(item.hash));
            }
            pending.insert(item.hash, (item.kind, tx));
        }
        if let Err(e) = self.send(Message::GetData(vec![item])) {
            self.pending.lock().remove(&item.hash);
            return Err(e);
        }
        Ok(rx)
    }

    /// Complete the request a delivered payload answers. Returns `false` if
    /// nothing of that kind was pending under its hash.
    pub fn resolve(&self, payload: Payload) -> bool {
        let hash = payload.hash();
        let responder = {
            let mut pending = self.pending.lock();
            match pending.get(&hash) {
                Some((kind, _)) if payload.answers(*kind) => pending.remove(&hash),
                _ => None,
            }
        };
        match responder {
            Some((_, tx)) => {
                let _ = tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fail the request for an item the peer does not have.
    pub fn reject(&self, item: &InventoryItem) -> bool {
        match self.pending.lock().remove(&item.hash) {
            Some((_, tx)) => {
                let _ = tx.send(Err(NetError::NotFound(item.hash)));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without answering it.
    pub fn cancel(&self, hash: &Hash) -> bool {
        self.pending.lock().remove(hash).is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Request a block and wait for it, failing after `timeout`.
    pub async fn wait_block_download(
        &self,
        hash: BlockHash,
        timeout: Duration,
    ) -> Result<Block, NetError> {
        let rx = self.request(InventoryItem::block(hash))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(Payload::Block(block)))) => Ok(block),
            Ok(Ok(Ok(other))) => Err(NetError::Protocol(format!(
                "expected block {hash}, got {}",
                other.hash()
            ))),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(NetError::Disconnected),
            Err(_) => {
                self.cancel(&hash.0);
                debug!(peer = self.id, block = %hash, "Block download timed out");
                Err(NetError::Timeout(hash.0))
            }
        }
    }

    // === Lifecycle ===

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the channel down, failing every outstanding request.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        let cancelled = pending.len();
        for (_, (_, tx)) in pending {
            let _ = tx.send(Err(NetError::Disconnected));
        }
        debug!(peer = self.id, label = %self.label, cancelled, "Peer channel closed");
    }

    /// Start the ordered inbound task. Messages pushed into the returned
    /// sender reach `handler` one at a time, in order. The channel closes
    /// once `max_violations` protocol violations have been counted.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        max_violations: u32,
    ) -> mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let peer = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if peer.is_closed() {
                    break;
                }
                let kind = message.type_name();
                match handler.handle(&peer, message).await {
                    Ok(()) => {}
                    Err(e) if e.is_protocol_violation() => {
                        let count = peer.record_violation();
                        warn!(peer = peer.id, message = kind, error = %e, violations = count, "Protocol violation");
                        if count >= max_violations {
                            warn!(peer = peer.id, "Too many protocol violations, disconnecting");
                            peer.close();
                            break;
                        }
                    }
                    Err(e) => debug!(peer = peer.id, message = kind, error = %e, "Message not processed"),
                }
            }
        });
        tx
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.close();
    }
}
