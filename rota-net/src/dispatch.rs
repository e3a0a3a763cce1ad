//! Inbound message processors.
//!
//! ```text
//!   Version ──► Verack ──► (clock offset, handshake done)
//!   Inventory ──► GetData ──► NewBlock | Block | Transaction | Consensus | NotFound
//!   Transaction ──► validate ──► mempool ──► filter ──► relay
//!   NewBlock ──► ChainState::accept_block ──► filter ──► relay (except sender)
//!      └─ parent unknown ──► orphan queue ──► GetData(parent) ──► ... ──► connect children
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use rota_chain::{ChainError, ChainState};
use rota_consensus::{ConsensusMeeting, MeetingError, MeetingMessage};
use rota_core::{Block, BlockHash, TimeSource, Transaction, TxId};
use rota_storage::{BlockStore, ChainStore, StateStore};

use crate::error::NetError;
use crate::network::PeerManager;
use crate::peer::{MessageHandler, Payload, PeerChannel};
use crate::protocol::{
    InventoryItem, InventoryKind, Message, ProtocolVersion, VerackMessage, VersionMessage,
};

/// Upper bound on blocks held while their parents are downloaded.
pub const MAX_ORPHAN_BLOCKS: usize = 512;

/// Blocks waiting for a parent, keyed by the parent's hash.
type OrphanMap = Arc<Mutex<HashMap<BlockHash, Vec<Block>>>>;

/// Routes every inbound message to its processor.
pub struct MessageDispatcher<S: ChainStore> {
    chain: Arc<ChainState<S>>,
    meeting: Arc<ConsensusMeeting<S>>,
    network: Arc<PeerManager>,
    orphans: OrphanMap,
}

impl<S: ChainStore + 'static> MessageDispatcher<S> {
    pub fn new(
        chain: Arc<ChainState<S>>,
        meeting: Arc<ConsensusMeeting<S>>,
        network: Arc<PeerManager>,
    ) -> Self {
        Self {
            chain,
            meeting,
            network,
            orphans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of received blocks still waiting for a parent.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().values().map(Vec::len).sum()
    }

    fn version_message(&self) -> Result<VersionMessage, NetError> {
        let best = self.chain.best_header()?;
        Ok(VersionMessage {
            version: ProtocolVersion::CURRENT,
            chain_id: self.network.config().chain_id.clone(),
            best_height: best.height,
            best_hash: best.hash(),
            timestamp: self.network.clock().current_time_millis(),
        })
    }

    fn send_version(&self, peer: &PeerChannel) -> Result<(), NetError> {
        if peer.mark_version_sent() {
            peer.send(Message::Version(self.version_message()?))?;
        }
        Ok(())
    }

    // === Handshake ===

    fn on_version(&self, peer: &Arc<PeerChannel>, version: VersionMessage) -> Result<(), NetError> {
        if !version.version.is_compatible_with(&ProtocolVersion::CURRENT) {
            return Err(NetError::Protocol(format!(
                "incompatible protocol version {}",
                version.version
            )));
        }
        if version.chain_id != self.network.config().chain_id {
            return Err(NetError::Protocol(format!(
                "chain id mismatch: {}",
                version.chain_id
            )));
        }
        peer.set_best_height(version.best_height);

        if peer.mark_verack_sent() {
            let best = self.chain.best_header()?;
            peer.send(Message::Verack(VerackMessage {
                best_height: best.height,
                best_hash: best.hash(),
                timestamp: self.network.clock().current_time_millis(),
            }))?;
        }
        self.catch_up(peer, version.best_height, version.best_hash)
    }

    fn on_verack(&self, peer: &Arc<PeerChannel>, ack: VerackMessage) -> Result<(), NetError> {
        let clock = self.network.clock();
        let offset = ack.timestamp - clock.local_time_millis();
        if !peer.complete_handshake(offset) {
            return Err(NetError::Protocol("duplicate verack".into()));
        }
        peer.set_best_height(ack.best_height);
        if clock.set_offset_once(offset) {
            info!(peer = peer.id(), offset, "Network time offset set");
        }
        info!(peer = peer.id(), best_height = ack.best_height, offset, "Handshake complete");
        self.send_version(peer)?;
        self.catch_up(peer, ack.best_height, ack.best_hash)
    }

    // === Block download ===

    /// Ask a handshaken peer for its best block when it is ahead of us. The
    /// block's missing ancestors are then fetched one by one through
    /// [`Self::queue_orphan`].
    fn catch_up(
        &self,
        peer: &Arc<PeerChannel>,
        best_height: u64,
        best_hash: BlockHash,
    ) -> Result<(), NetError> {
        let local = self.chain.height()?;
        if !peer.is_handshake_done() || best_height <= local {
            return Ok(());
        }
        if self.chain.store().get_block(&best_hash)?.is_some() {
            return Ok(());
        }
        info!(peer = peer.id(), best_height, local, "Peer is ahead, downloading");
        self.fetch_block(peer, best_hash);
        Ok(())
    }

    /// Request a single block from `peer` in the background.
    ///
    /// The block itself comes back through [`Self::on_block`], which resolves
    /// the request. The waiter only drops the orphans that depended on the
    /// block when the download fails or times out.
    fn fetch_block(&self, peer: &Arc<PeerChannel>, hash: BlockHash) {
        let peer = peer.clone();
        let orphans = self.orphans.clone();
        let timeout = self.network.config().block_download_timeout;
        tokio::spawn(async move {
            match peer.wait_block_download(hash, timeout).await {
                Ok(_) | Err(NetError::AlreadyRequested(_)) => {}
                Err(e) => {
                    let dropped = orphans.lock().remove(&hash).map_or(0, |c| c.len());
                    debug!(peer = peer.id(), block = %hash, error = %e, dropped, "Block download failed");
                }
            }
        });
    }

    /// Hold `block` until its parent arrives, requesting the parent unless a
    /// request for it is already outstanding.
    fn queue_orphan(&self, peer: &Arc<PeerChannel>, block: Block) {
        let parent = block.header.prev_hash;
        let hash = block.hash();
        let first = {
            let mut orphans = self.orphans.lock();
            let held: usize = orphans.values().map(Vec::len).sum();
            if held >= MAX_ORPHAN_BLOCKS {
                warn!(peer = peer.id(), block = %hash, held, "Orphan queue full, dropping block");
                return;
            }
            let children = orphans.entry(parent).or_default();
            if children.iter().any(|b| b.hash() == hash) {
                return;
            }
            children.push(block);
            children.len() == 1
        };
        debug!(peer = peer.id(), block = %hash, parent = %parent, "Parent unknown, queued block");
        if first {
            self.fetch_block(peer, parent);
        }
    }

    /// Apply every queued descendant of `parent`, depth first.
    fn connect_orphans(&self, peer: &PeerChannel, parent: BlockHash) -> Result<(), NetError> {
        let mut ready = vec![parent];
        while let Some(parent) = ready.pop() {
            let children = self.orphans.lock().remove(&parent).unwrap_or_default();
            for child in children {
                let hash = child.hash();
                if self.apply_block(peer, &child)? {
                    ready.push(hash);
                }
            }
        }
        Ok(())
    }

    // === Inventory ===

    fn is_known(&self, item: &InventoryItem) -> Result<bool, NetError> {
        if self.network.filter().contains(&item.hash) {
            return Ok(true);
        }
        let known = match item.kind {
            InventoryKind::NewBlock | InventoryKind::Block => self
                .chain
                .store()
                .get_block(&BlockHash(item.hash))?
                .is_some(),
            InventoryKind::Transaction => {
                let id = TxId(item.hash);
                self.chain.mempool().contains(&id) || self.chain.store().has_transaction(&id)?
            }
            InventoryKind::Consensus => self.meeting.get_meeting_message(&item.hash).is_some(),
        };
        Ok(known)
    }

    fn on_inventory(&self, peer: &PeerChannel, items: Vec<InventoryItem>) -> Result<(), NetError> {
        let mut wanted = Vec::new();
        for item in items {
            if !self.is_known(&item)? {
                wanted.push(item);
            }
        }
        if !wanted.is_empty() {
            debug!(peer = peer.id(), count = wanted.len(), "Requesting advertised data");
            peer.send(Message::GetData(wanted))?;
        }
        Ok(())
    }

    fn on_get_data(&self, peer: &PeerChannel, items: Vec<InventoryItem>) -> Result<(), NetError> {
        let mut missing = Vec::new();
        for item in items {
            let reply = match item.kind {
                InventoryKind::NewBlock | InventoryKind::Block => self
                    .chain
                    .store()
                    .get_block(&BlockHash(item.hash))?
                    .map(|block| match item.kind {
                        InventoryKind::NewBlock => Message::NewBlock(block),
                        _ => Message::Block(block),
                    }),
                InventoryKind::Transaction => {
                    let id = TxId(item.hash);
                    match self.chain.mempool().get_by_id(&id) {
                        Some(tx) => Some(Message::Transaction(tx)),
                        None => self
                            .chain
                            .store()
                            .get_transaction(&id)?
                            .map(|record| Message::Transaction(record.tx)),
                    }
                }
                InventoryKind::Consensus => self
                    .meeting
                    .get_meeting_message(&item.hash)
                    .map(Message::Consensus),
            };
            match reply {
                Some(message) => peer.send(message)?,
                None => missing.push(item),
            }
        }
        if !missing.is_empty() {
            peer.send(Message::NotFound(missing))?;
        }
        Ok(())
    }

    fn on_not_found(&self, peer: &PeerChannel, items: Vec<InventoryItem>) -> Result<(), NetError> {
        for item in &items {
            if peer.reject(item) {
                debug!(peer = peer.id(), hash = %item.hash, "Requested item not found");
            }
        }
        Ok(())
    }

    // === Payloads ===

    fn on_transaction(&self, peer: &PeerChannel, tx: Transaction) -> Result<(), NetError> {
        let id = tx.id();
        peer.resolve(Payload::Transaction(tx.clone()));

        let mempool = self.chain.mempool();
        if self.network.filter().contains(&id.0) || mempool.contains(&id) {
            return Ok(());
        }
        match self.chain.validator().validate(&tx, &[]) {
            Ok(()) => {}
            // Spends a transaction that is still pending here.
            Err(rejection)
                if rejection.is_ordering_deferral()
                    && tx.inputs.iter().any(|i| mempool.contains(&i.outpoint.tx)) => {}
            Err(rejection) => {
                debug!(peer = peer.id(), tx = %id, reason = %rejection, "Rejected relayed transaction");
                return Ok(());
            }
        }
        if mempool.add(tx) {
            debug!(peer = peer.id(), tx = %id, "Admitted transaction");
            self.network
                .advertise(InventoryItem::transaction(id), Some(peer.id()));
        }
        Ok(())
    }

    fn on_block(&self, peer: &Arc<PeerChannel>, block: Block) -> Result<(), NetError> {
        let hash = block.hash();
        let height = block.height();
        peer.resolve(Payload::Block(block.clone()));

        if self.network.filter().contains(&hash.0) {
            return Ok(());
        }
        if height > self.chain.height()? + 1
            && self.chain.store().get_block(&block.header.prev_hash)?.is_none()
        {
            peer.set_best_height(height);
            self.queue_orphan(peer, block);
            return Ok(());
        }
        if self.apply_block(peer, &block)? {
            self.connect_orphans(peer, hash)?;
        }
        Ok(())
    }

    /// Returns whether the block was added to the chain.
    fn apply_block(&self, peer: &PeerChannel, block: &Block) -> Result<bool, NetError> {
        let hash = block.hash();
        let height = block.height();
        match self.chain.accept_block(block) {
            Ok(applied) => {
                peer.set_best_height(height);
                self.network.set_local_height(applied.height);
                info!(peer = peer.id(), height, hash = %hash, "Accepted block");
                self.network
                    .advertise(InventoryItem::new_block(hash), Some(peer.id()));
                Ok(true)
            }
            Err(ChainError::AlreadyKnown(_)) => {
                self.network.filter().insert(hash.0);
                Ok(false)
            }
            Err(ChainError::Storage(e)) => Err(e.into()),
            Err(e) => {
                warn!(peer = peer.id(), height, hash = %hash, error = %e, "Rejected block");
                let dropped = self.orphans.lock().remove(&hash).map_or(0, |c| c.len());
                if dropped > 0 {
                    debug!(peer = peer.id(), hash = %hash, dropped, "Dropped descendants of rejected block");
                }
                Ok(false)
            }
        }
    }

    fn on_consensus(&self, peer: &PeerChannel, message: MeetingMessage) -> Result<(), NetError> {
        let hash = message.hash();
        peer.resolve(Payload::Consensus(message.clone()));

        match self.meeting.receive_meeting_message(message) {
            Ok(reply) => {
                self.network
                    .advertise(InventoryItem::consensus(hash), Some(peer.id()));
                if let Some(reply) = reply {
                    peer.send(Message::Consensus(reply))?;
                }
                Ok(())
            }
            Err(e @ (MeetingError::InvalidMessage(_) | MeetingError::UnknownSender(_))) => {
                Err(NetError::Protocol(e.to_string()))
            }
            Err(e) => {
                debug!(peer = peer.id(), error = %e, "Meeting message not processed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<S: ChainStore + 'static> MessageHandler for MessageDispatcher<S> {
    async fn connected(&self, peer: &Arc<PeerChannel>) -> Result<(), NetError> {
        self.send_version(peer)
    }

    async fn handle(&self, peer: &Arc<PeerChannel>, message: Message) -> Result<(), NetError> {
        if !peer.is_handshake_done()
            && !matches!(message, Message::Version(_) | Message::Verack(_))
        {
            return Err(NetError::Protocol(format!(
                "{} before handshake",
                message.type_name()
            )));
        }

        match message {
            Message::Version(version) => self.on_version(peer, version),
            Message::Verack(ack) => self.on_verack(peer, ack),
            Message::Inventory(items) => self.on_inventory(peer, items),
            Message::GetData(items) => self.on_get_data(peer, items),
            Message::NotFound(items) => self.on_not_found(peer, items),
            Message::Transaction(tx) => self.on_transaction(peer, tx),
            Message::NewBlock(block) | Message::Block(block) => self.on_block(peer, block),
            Message::Consensus(message) => self.on_consensus(peer, message),
            Message::Ping(nonce) => peer.send(Message::Pong(nonce)),
            Message::Pong(nonce) => {
                if !peer.check_pong(nonce) {
                    debug!(peer = peer.id(), nonce, "Unexpected pong");
                }
                Ok(())
            }
        }
    }
}
