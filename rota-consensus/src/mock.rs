//! In-process collaborators for tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use rota_core::{Block, BlockHash};

use crate::message::MeetingMessage;
use crate::traits::{AccountProvider, MiningAccount, NetworkHandle};

/// Network stand-in that records what would have been sent.
#[derive(Debug)]
pub struct MockNetwork {
    can_broadcast: AtomicBool,
    synced: AtomicBool,
    announced: Mutex<Vec<BlockHash>>,
    meeting_messages: Mutex<Vec<MeetingMessage>>,
}

impl MockNetwork {
    /// A network that is ready and synced.
    pub fn ready() -> Self {
        Self {
            can_broadcast: AtomicBool::new(true),
            synced: AtomicBool::new(true),
            announced: Mutex::new(Vec::new()),
            meeting_messages: Mutex::new(Vec::new()),
        }
    }

    /// A network with no peers yet.
    pub fn offline() -> Self {
        let network = Self::ready();
        network.set_can_broadcast(false);
        network
    }

    pub fn set_can_broadcast(&self, value: bool) {
        self.can_broadcast.store(value, Ordering::SeqCst);
    }

    pub fn set_synced(&self, value: bool) {
        self.synced.store(value, Ordering::SeqCst);
    }

    pub fn announced(&self) -> Vec<BlockHash> {
        self.announced.lock().clone()
    }

    pub fn meeting_messages(&self) -> Vec<MeetingMessage> {
        self.meeting_messages.lock().clone()
    }
}

#[async_trait]
impl NetworkHandle for MockNetwork {
    fn can_broadcast(&self) -> bool {
        self.can_broadcast.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn announce_block(&self, block: &Block) {
        self.announced.lock().push(block.hash());
    }

    async fn broadcast_meeting_message(&self, message: MeetingMessage) {
        self.meeting_messages.lock().push(message);
    }
}

/// Account provider returning a fixed, replaceable account.
#[derive(Debug, Default)]
pub struct StaticAccount {
    account: RwLock<Option<MiningAccount>>,
}

impl StaticAccount {
    pub fn new(account: Option<MiningAccount>) -> Self {
        Self {
            account: RwLock::new(account),
        }
    }

    pub fn set(&self, account: Option<MiningAccount>) {
        *self.account.write() = account;
    }
}

impl AccountProvider for StaticAccount {
    fn mining_account(&self) -> Option<MiningAccount> {
        self.account.read().clone()
    }
}
