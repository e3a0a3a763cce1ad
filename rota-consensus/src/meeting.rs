//! Round-robin slot scheduling.
//!
//! A round gives every consensus account one slot of `time_period`, in pool
//! order. The meeting tracks the current and previous round, tells the block
//! producer when the local slot opens, and reports members whose slot fully
//! elapsed without a block on the chain.
//!
//! ```text
//!  period_start_time
//!  │
//!  ▼
//!  ├── slot 0 ──┼── slot 1 ──┼── slot 2 ──┤ next round ...
//!  │ member[0]  │ member[1]  │ member[2]  │
//!  begin        end = begin + time_period
//! ```
//!
//! Membership is fixed at each round boundary, so pool changes take effect in
//! the next round. The meeting keeps a short log of membership changes keyed
//! by the time they took effect, which lets a node that skipped several
//! rounds rebuild each of them with the members it had at its boundary.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rota_chain::{BlockChangedListener, ConsensusPool};
use rota_core::{
    BlockHash, ChainParams, ConsensusAccount, Hash, Hash160, TimeSource, ViolationEvidence,
};
use rota_storage::ChainStore;

use crate::message::{MeetingKind, MeetingMessage};
use crate::traits::NetworkHandle;

/// Meeting configuration.
#[derive(Debug, Clone)]
pub struct MeetingConfig {
    /// Whole rounds without a block after which the local view is stale and
    /// a peer's round state may be adopted.
    pub stale_after_rounds: i64,
    /// Meeting messages kept for data requests.
    pub message_cache_size: usize,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            stale_after_rounds: 2,
            message_cache_size: 1024,
        }
    }
}

/// Lifecycle of the meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStatus {
    Idle,
    Active,
    Stopped,
}

/// A member's window inside a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningSlot {
    /// Start of the round, unix millis.
    pub period_start_time: i64,
    pub begin_time: i64,
    pub end_time: i64,
    /// Number of slots in the round.
    pub period_count: u32,
    /// Slot length in millis.
    pub time_period: i64,
    pub slot_index: u32,
}

impl MiningSlot {
    pub fn contains(&self, now: i64) -> bool {
        self.begin_time <= now && now < self.end_time
    }
}

/// A member whose slot elapsed with no block on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutViolation {
    pub address: Hash160,
    /// Start of the round the slot belonged to.
    pub period_start_point: i64,
}

impl TimeoutViolation {
    pub fn evidence(&self) -> ViolationEvidence {
        ViolationEvidence::not_broadcast(self.address, self.period_start_point)
    }
}

/// Meeting errors.
#[derive(Debug, thiserror::Error)]
pub enum MeetingError {
    #[error("meeting not started")]
    NotStarted,

    #[error("meeting stopped")]
    Stopped,

    #[error("no local consensus account")]
    NoAccount,

    #[error("{0} holds no slot in the current round")]
    NotScheduled(Hash160),

    #[error("consensus pool is empty")]
    EmptyPool,

    #[error("invalid meeting message: {0}")]
    InvalidMessage(String),

    #[error("meeting message from non-member {0}")]
    UnknownSender(Hash160),

    #[error("storage error: {0}")]
    Storage(#[from] rota_core::Error),
}

#[derive(Debug, Clone)]
struct Round {
    start: i64,
    members: Vec<ConsensusAccount>,
}

impl Round {
    fn len_millis(&self, time_period: i64) -> i64 {
        self.members.len() as i64 * time_period
    }

    fn slot(&self, index: usize, time_period: i64) -> MiningSlot {
        let begin_time = self.start + index as i64 * time_period;
        MiningSlot {
            period_start_time: self.start,
            begin_time,
            end_time: begin_time + time_period,
            period_count: self.members.len() as u32,
            time_period,
            slot_index: index as u32,
        }
    }

    fn index_of(&self, address: &Hash160) -> Option<usize> {
        self.members.iter().position(|m| &m.address == address)
    }
}

struct MeetingInner {
    status: MeetingStatus,
    account: Option<ConsensusAccount>,
    current: Option<Round>,
    previous: Option<Round>,
    stale: bool,
    /// Last slot handed to the producer, as (round start, slot index).
    signalled: Option<(i64, usize)>,
    processed: HashSet<TimeoutViolation>,
    messages: HashMap<Hash, MeetingMessage>,
    message_order: VecDeque<Hash>,
    ready: HashSet<Hash160>,
    /// Membership changes, oldest first, as (effective from, members).
    membership: VecDeque<(i64, Vec<ConsensusAccount>)>,
}

impl MeetingInner {
    /// Log the membership in effect from `at` if it differs from the last entry.
    fn record_members(&mut self, at: i64, members: Vec<ConsensusAccount>) {
        let last_at = match self.membership.back() {
            Some((_, last)) if *last == members => return,
            Some((last_at, _)) => *last_at,
            None => at,
        };
        self.membership.push_back((at.max(last_at), members));
    }

    /// Membership in effect at `boundary`.
    fn members_at(&self, boundary: i64) -> Option<&Vec<ConsensusAccount>> {
        self.membership
            .iter()
            .rev()
            .find(|(at, _)| *at <= boundary)
            .map(|(_, members)| members)
    }

    fn changed_within(&self, after: i64, until: i64) -> bool {
        self.membership
            .iter()
            .any(|(at, _)| *at > after && *at <= until)
    }

    /// Drop entries superseded before `start`.
    fn prune_members(&mut self, start: i64) {
        while self.membership.len() > 1 && self.membership[1].0 <= start {
            self.membership.pop_front();
        }
    }
}

/// The slot scheduler.
pub struct ConsensusMeeting<S: ChainStore> {
    config: MeetingConfig,
    params: ChainParams,
    store: Arc<S>,
    pool: Arc<ConsensusPool>,
    clock: Arc<dyn TimeSource>,
    network: Arc<dyn NetworkHandle>,
    inner: Mutex<MeetingInner>,
}

impl<S: ChainStore> ConsensusMeeting<S> {
    pub fn new(
        config: MeetingConfig,
        params: ChainParams,
        store: Arc<S>,
        pool: Arc<ConsensusPool>,
        clock: Arc<dyn TimeSource>,
        network: Arc<dyn NetworkHandle>,
    ) -> Self {
        Self {
            config,
            params,
            store,
            pool,
            clock,
            network,
            inner: Mutex::new(MeetingInner {
                status: MeetingStatus::Idle,
                account: None,
                current: None,
                previous: None,
                stale: false,
                signalled: None,
                processed: HashSet::new(),
                messages: HashMap::new(),
                message_order: VecDeque::new(),
                ready: HashSet::new(),
                membership: VecDeque::new(),
            }),
        }
    }

    pub fn status(&self) -> MeetingStatus {
        self.inner.lock().status
    }

    /// The local view is too old to judge other members.
    pub fn is_stale(&self) -> bool {
        self.inner.lock().stale
    }

    /// Bind the local identity, or clear it with `None`.
    pub fn set_account(&self, account: Option<ConsensusAccount>) {
        let mut inner = self.inner.lock();
        match &account {
            Some(a) => debug!(address = %a.address, "Meeting account set"),
            None => debug!("Meeting account cleared"),
        }
        inner.account = account;
    }

    pub fn account(&self) -> Option<ConsensusAccount> {
        self.inner.lock().account
    }

    /// Start and members of the current round.
    pub fn current_round(&self) -> Option<(i64, Vec<ConsensusAccount>)> {
        let now = self.clock.current_time_millis();
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now).ok()?;
        inner.current.as_ref().map(|r| (r.start, r.members.clone()))
    }

    /// Members that announced themselves since the meeting started.
    pub fn ready_members(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Join the schedule.
    ///
    /// Anchors the round at the best block's round (or at genesis), announces
    /// `hello` to peers and marks the view stale when the chain has been
    /// silent for more than `stale_after_rounds` rounds; a stale view adopts
    /// the first acceptable round state a peer sends back.
    pub async fn start_syn(&self, hello: Option<MeetingMessage>) -> Result<(), MeetingError> {
        let now = self.clock.current_time_millis();
        let tp = self.params.time_period_millis();
        let best = self.store.get_best_block_header()?;
        let members = self.pool.members();
        if members.is_empty() {
            return Err(MeetingError::EmptyPool);
        }

        let anchor = if best.height > 0 && best.period_count > 0 {
            best.period_start_time
        } else {
            self.params.genesis_time
        };

        {
            let mut inner = self.inner.lock();
            if inner.status == MeetingStatus::Stopped {
                return Err(MeetingError::Stopped);
            }
            inner.record_members(anchor, members.clone());
            let round = Round {
                start: anchor,
                members,
            };
            let rounds_behind = (now - anchor).max(0) / round.len_millis(tp);
            inner.stale = rounds_behind > self.config.stale_after_rounds;
            inner.current = Some(round);
            self.advance(&mut inner, now)?;
            // Rounds before joining are not judged.
            inner.previous = None;
            inner.status = MeetingStatus::Active;

            info!(
                height = best.height,
                round_start = inner.current.as_ref().map(|r| r.start).unwrap_or(anchor),
                stale = inner.stale,
                "Joined consensus meeting"
            );
        }

        if let Some(hello) = hello {
            self.send_meeting_message(hello).await;
        }
        Ok(())
    }

    /// Cache a message and broadcast it.
    pub async fn send_meeting_message(&self, message: MeetingMessage) {
        self.cache(&mut self.inner.lock(), message.clone());
        self.network.broadcast_meeting_message(message).await;
    }

    /// Look up a cached meeting message by hash.
    pub fn get_meeting_message(&self, hash: &Hash) -> Option<MeetingMessage> {
        self.inner.lock().messages.get(hash).cloned()
    }

    /// The local slot in the current round.
    pub fn get_mine_mining_infos(&self) -> Result<MiningSlot, MeetingError> {
        let now = self.clock.current_time_millis();
        let mut inner = self.inner.lock();
        Self::require_active(&inner)?;
        self.advance(&mut inner, now)?;

        let account = inner.account.ok_or(MeetingError::NoAccount)?;
        let round = inner.current.as_ref().ok_or(MeetingError::NotStarted)?;
        let index = round
            .index_of(&account.address)
            .ok_or(MeetingError::NotScheduled(account.address))?;
        Ok(round.slot(index, self.params.time_period_millis()))
    }

    /// Return the local slot once, when it is open.
    pub fn poll_slot(&self) -> Option<MiningSlot> {
        let now = self.clock.current_time_millis();
        let mut inner = self.inner.lock();
        if inner.status != MeetingStatus::Active {
            return None;
        }
        if let Err(e) = self.advance(&mut inner, now) {
            debug!(error = %e, "Cannot advance round");
            return None;
        }

        let address = inner.account?.address;
        let round = inner.current.as_ref()?;
        let index = round.index_of(&address)?;
        let slot = round.slot(index, self.params.time_period_millis());
        let key = (slot.period_start_time, index);
        if !slot.contains(now) || inner.signalled == Some(key) {
            return None;
        }
        inner.signalled = Some(key);
        debug!(
            begin = slot.begin_time,
            end = slot.end_time,
            index,
            "Local slot open"
        );
        Some(slot)
    }

    /// Members of the previous and current round whose slot ended with no
    /// block of theirs in that round on the chain.
    ///
    /// The local account and already processed entries are excluded. Empty
    /// while the local view is stale.
    pub fn get_timeout_list(&self) -> Result<Vec<TimeoutViolation>, MeetingError> {
        let now = self.clock.current_time_millis();
        let tp = self.params.time_period_millis();
        let mut inner = self.inner.lock();
        Self::require_active(&inner)?;
        self.advance(&mut inner, now)?;
        if inner.stale {
            return Ok(Vec::new());
        }

        let rounds: Vec<&Round> = inner.previous.iter().chain(inner.current.iter()).collect();
        let Some(earliest) = rounds.first().map(|r| r.start) else {
            return Ok(Vec::new());
        };
        let produced = self.produced_since(earliest)?;
        let local = inner.account.map(|a| a.address);

        let mut out = Vec::new();
        for round in rounds {
            for (index, member) in round.members.iter().enumerate() {
                if round.slot(index, tp).end_time > now || Some(member.address) == local {
                    continue;
                }
                let violation = TimeoutViolation {
                    address: member.address,
                    period_start_point: round.start,
                };
                if inner.processed.contains(&violation)
                    || produced.contains(&(round.start, member.address))
                {
                    continue;
                }
                out.push(violation);
            }
        }
        Ok(out)
    }

    /// Exclude a violation from future timeout lists.
    pub fn mark_processed(&self, violation: &TimeoutViolation) {
        self.inner.lock().processed.insert(*violation);
    }

    /// Handle a meeting message from a peer. Returns the reply to send back,
    /// if any.
    pub fn receive_meeting_message(
        &self,
        message: MeetingMessage,
    ) -> Result<Option<MeetingMessage>, MeetingError> {
        let hash = message.hash();
        if self.inner.lock().messages.contains_key(&hash) {
            return Ok(None);
        }

        match message.kind.clone() {
            MeetingKind::PullState => {
                message
                    .verify()
                    .map_err(|e| MeetingError::InvalidMessage(e.to_string()))?;
                if !self.pool.contains(&message.sender) {
                    return Err(MeetingError::UnknownSender(message.sender));
                }
                let now = self.clock.current_time_millis();
                let height = self.store.get_best_block_header()?.height;
                let mut inner = self.inner.lock();
                inner.ready.insert(message.sender);
                self.cache(&mut inner, message);

                if inner.status != MeetingStatus::Active || inner.stale {
                    return Ok(None);
                }
                self.advance(&mut inner, now)?;
                let sender = inner.account.map(|a| a.address).unwrap_or(Hash160::ZERO);
                Ok(inner.current.as_ref().map(|round| {
                    MeetingMessage::round_state(
                        sender,
                        height,
                        round.start,
                        self.params.time_period_millis(),
                        round.members.clone(),
                        now,
                    )
                }))
            }
            MeetingKind::RoundState {
                period_start_time,
                time_period,
                members,
            } => {
                let (start, tp) = (period_start_time, time_period);
                let now = self.clock.current_time_millis();
                let mut inner = self.inner.lock();
                self.cache(&mut inner, message);
                if !inner.stale || inner.status != MeetingStatus::Active {
                    return Ok(None);
                }
                if tp != self.params.time_period_millis() {
                    return Err(MeetingError::InvalidMessage("slot length mismatch".into()));
                }
                if members.is_empty()
                    || members
                        .iter()
                        .any(|m| !m.is_consistent() || !self.pool.contains(&m.address))
                {
                    return Err(MeetingError::InvalidMessage(
                        "round lists unknown members".into(),
                    ));
                }

                inner.current = Some(Round { start, members });
                inner.previous = None;
                inner.stale = false;
                self.advance(&mut inner, now)?;
                info!(round_start = start, "Adopted round state from peer");
                Ok(None)
            }
        }
    }

    /// Leave the schedule. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.status != MeetingStatus::Stopped {
            inner.status = MeetingStatus::Stopped;
            info!("Consensus meeting stopped");
        }
    }

    fn require_active(inner: &MeetingInner) -> Result<(), MeetingError> {
        match inner.status {
            MeetingStatus::Active => Ok(()),
            MeetingStatus::Idle => Err(MeetingError::NotStarted),
            MeetingStatus::Stopped => Err(MeetingError::Stopped),
        }
    }

    /// Roll the current round forward until it covers `now`.
    ///
    /// Rounds are entered one boundary at a time, each with the membership in
    /// effect at its own start. A stretch with no membership change is
    /// skipped in one step.
    fn advance(&self, inner: &mut MeetingInner, now: i64) -> Result<(), MeetingError> {
        let tp = self.params.time_period_millis();
        inner.record_members(now, self.pool.members());
        loop {
            let round = inner.current.as_mut().ok_or(MeetingError::NotStarted)?;
            if round.members.is_empty() {
                round.members = self.pool.members();
                if round.members.is_empty() {
                    return Err(MeetingError::EmptyPool);
                }
            }

            let end = round.start + round.len_millis(tp);
            if now < end {
                break;
            }

            let members = match inner.members_at(end) {
                Some(members) => members.clone(),
                None => self.pool.members(),
            };
            if members.is_empty() {
                return Err(MeetingError::EmptyPool);
            }
            let mut next = Round {
                start: end,
                members,
            };
            let len = next.len_millis(tp);
            let skipped = if inner.changed_within(end, now) {
                0
            } else {
                (now - end) / len
            };
            let previous = if skipped == 0 {
                inner.current.take()
            } else {
                Some(Round {
                    start: end + (skipped - 1) * len,
                    members: next.members.clone(),
                })
            };
            next.start = end + skipped * len;
            debug!(
                round_start = next.start,
                members = next.members.len(),
                skipped,
                "Entered new round"
            );

            let oldest = previous.as_ref().map_or(next.start, |r| r.start);
            inner.previous = previous;
            inner.current = Some(next);
            inner.processed.retain(|v| v.period_start_point >= oldest);
        }
        if let Some(start) = inner.current.as_ref().map(|r| r.start) {
            inner.prune_members(start);
        }
        Ok(())
    }

    /// (round start, producer) of every block in rounds starting at or after
    /// `earliest`, walking back from the tip.
    fn produced_since(&self, earliest: i64) -> Result<HashSet<(i64, Hash160)>, MeetingError> {
        let mut produced = HashSet::new();
        let mut header = self.store.get_best_block_header()?;
        while header.height > 0 && header.period_start_time >= earliest {
            produced.insert((header.period_start_time, header.producer_address()));
            match self.store.get_header(&header.prev_hash)? {
                Some(parent) => header = parent,
                None => {
                    warn!(height = header.height, "Parent header missing during timeout scan");
                    break;
                }
            }
        }
        Ok(produced)
    }

    fn cache(&self, inner: &mut MeetingInner, message: MeetingMessage) {
        let hash = message.hash();
        if inner.messages.insert(hash, message).is_none() {
            inner.message_order.push_back(hash);
        }
        while inner.message_order.len() > self.config.message_cache_size {
            if let Some(old) = inner.message_order.pop_front() {
                inner.messages.remove(&old);
            }
        }
    }
}

/// Every committed block logs the membership it leaves behind; on a stale
/// view it also re-anchors the schedule on the block's round.
impl<S: ChainStore> BlockChangedListener for ConsensusMeeting<S> {
    fn on_changed(&self, _old_height: u64, new_height: u64, _old_hash: BlockHash, new_hash: BlockHash) {
        let header = match self.store.get_header(&new_hash) {
            Ok(Some(header)) => header,
            _ => return,
        };
        let mut inner = self.inner.lock();
        inner.record_members(header.timestamp, self.pool.members());
        if !inner.stale || inner.status != MeetingStatus::Active || header.period_count == 0 {
            return;
        }
        let members = match inner.members_at(header.period_start_time) {
            Some(members) => members.clone(),
            None => self.pool.members(),
        };
        inner.current = Some(Round {
            start: header.period_start_time,
            members,
        });
        inner.previous = None;
        inner.stale = false;
        let now = self.clock.current_time_millis();
        if let Err(e) = self.advance(&mut inner, now) {
            debug!(error = %e, "Cannot advance round after re-anchoring");
        }
        info!(height = new_height, round_start = header.period_start_time, "Re-anchored round on new block");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rota_core::{derive_address, BlockBuilder, MockClock, SecretKey, Transaction};
    use rota_storage::{BlockStore, MemoryStore};

    use crate::mock::MockNetwork;

    const TP: i64 = 10_000;

    struct Setup {
        keys: Vec<SecretKey>,
        store: Arc<MemoryStore>,
        pool: Arc<ConsensusPool>,
        clock: Arc<MockClock>,
        network: Arc<MockNetwork>,
        meeting: ConsensusMeeting<MemoryStore>,
    }

    fn params(genesis_time: i64) -> ChainParams {
        ChainParams {
            genesis_time,
            ..Default::default()
        }
    }

    fn setup(members: usize, genesis_time: i64) -> Setup {
        let keys: Vec<_> = (0..members).map(|_| SecretKey::generate()).collect();
        let registrations = keys.iter().map(|k| Transaction::register(k, 0)).collect();
        let genesis = BlockBuilder::new()
            .transactions(registrations)
            .timestamp(genesis_time)
            .seal(&keys[0]);
        let store = Arc::new(MemoryStore::with_genesis(&genesis).unwrap());
        let pool = Arc::new(ConsensusPool::new());
        for k in &keys {
            pool.add(derive_address(&k.public_key()), k.public_key());
        }
        let clock = Arc::new(MockClock::new(genesis_time));
        let network = Arc::new(MockNetwork::ready());
        let meeting = ConsensusMeeting::new(
            MeetingConfig::default(),
            params(genesis_time),
            store.clone(),
            pool.clone(),
            clock.clone(),
            network.clone(),
        );
        Setup {
            keys,
            store,
            pool,
            clock,
            network,
            meeting,
        }
    }

    fn account(key: &SecretKey) -> ConsensusAccount {
        ConsensusAccount::from_public_key(key.public_key())
    }

    #[tokio::test]
    async fn test_requires_start() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[1])));
        assert!(matches!(
            s.meeting.get_mine_mining_infos(),
            Err(MeetingError::NotStarted)
        ));
        assert!(s.meeting.poll_slot().is_none());
    }

    #[tokio::test]
    async fn test_slot_assignment_follows_pool_order() {
        let s = setup(3, 1_000);
        s.meeting.set_account(Some(account(&s.keys[2])));
        s.meeting.start_syn(None).await.unwrap();

        let slot = s.meeting.get_mine_mining_infos().unwrap();
        assert_eq!(slot.period_start_time, 1_000);
        assert_eq!(slot.begin_time, 1_000 + 2 * TP);
        assert_eq!(slot.end_time, 1_000 + 3 * TP);
        assert_eq!(slot.period_count, 3);
        assert_eq!(slot.slot_index, 2);
    }

    #[tokio::test]
    async fn test_rounds_roll_forward() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[0])));
        s.meeting.start_syn(None).await.unwrap();

        s.clock.set(5 * TP + 1);
        let slot = s.meeting.get_mine_mining_infos().unwrap();
        assert_eq!(slot.period_start_time, 4 * TP);
        assert_eq!(slot.begin_time, 4 * TP);
    }

    #[tokio::test]
    async fn test_poll_slot_signals_once() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[1])));
        s.meeting.start_syn(None).await.unwrap();

        assert!(s.meeting.poll_slot().is_none());
        s.clock.set(TP);
        let slot = s.meeting.poll_slot().unwrap();
        assert_eq!(slot.begin_time, TP);
        assert!(s.meeting.poll_slot().is_none());

        // Same slot in the next round.
        s.clock.set(3 * TP + 5);
        assert_eq!(s.meeting.poll_slot().map(|s| s.begin_time), Some(3 * TP));
    }

    #[tokio::test]
    async fn test_non_member_not_scheduled() {
        let s = setup(2, 0);
        let outsider = SecretKey::generate();
        s.meeting.set_account(Some(account(&outsider)));
        s.meeting.start_syn(None).await.unwrap();
        assert!(matches!(
            s.meeting.get_mine_mining_infos(),
            Err(MeetingError::NotScheduled(_))
        ));
        s.meeting.set_account(None);
        assert!(matches!(
            s.meeting.get_mine_mining_infos(),
            Err(MeetingError::NoAccount)
        ));
    }

    #[tokio::test]
    async fn test_membership_change_applies_next_round() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[0])));
        s.meeting.start_syn(None).await.unwrap();

        let newcomer = SecretKey::generate();
        s.pool.add(derive_address(&newcomer.public_key()), newcomer.public_key());
        assert_eq!(s.meeting.current_round().map(|(_, m)| m.len()), Some(2));

        s.clock.set(2 * TP);
        assert_eq!(s.meeting.current_round().map(|(_, m)| m.len()), Some(3));
    }

    #[tokio::test]
    async fn test_skipped_rounds_use_membership_at_each_boundary() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[0])));
        s.meeting.start_syn(None).await.unwrap();

        // A registration commits mid round 0 while the node is not polling.
        let newcomer = SecretKey::generate();
        let tip = s.store.get_best_block_header().unwrap();
        let block = BlockBuilder::new()
            .parent(tip.clone())
            .transactions(vec![Transaction::register(&newcomer, TP)])
            .timestamp(TP)
            .period(0, 2, 1)
            .seal(&s.keys[1]);
        s.store.save_block(&block).unwrap();
        s.pool.add(derive_address(&newcomer.public_key()), newcomer.public_key());
        s.meeting.on_changed(0, 1, tip.hash(), block.hash());

        // Round 0 [0, 2tp) keeps two members, round 1 [2tp, 5tp) has three,
        // so round 2 starts at 5tp rather than 6tp.
        s.clock.set(6 * TP);
        let (start, members) = s.meeting.current_round().unwrap();
        assert_eq!(start, 5 * TP);
        assert_eq!(members.len(), 3);
        assert_eq!(s.meeting.get_mine_mining_infos().unwrap().begin_time, 5 * TP);

        // The previous round is round 1, judged with its own members.
        let mut list = s.meeting.get_timeout_list().unwrap();
        list.sort_by_key(|v| v.address);
        let mut expected = vec![
            TimeoutViolation {
                address: derive_address(&s.keys[1].public_key()),
                period_start_point: 2 * TP,
            },
            TimeoutViolation {
                address: derive_address(&newcomer.public_key()),
                period_start_point: 2 * TP,
            },
        ];
        expected.sort_by_key(|v| v.address);
        assert_eq!(list, expected);
    }

    #[tokio::test]
    async fn test_skipped_rounds_match_polling_every_boundary() {
        let s = setup(2, 0);
        let sleeper = ConsensusMeeting::new(
            MeetingConfig::default(),
            params(0),
            s.store.clone(),
            s.pool.clone(),
            s.clock.clone(),
            s.network.clone(),
        );
        for meeting in [&s.meeting, &sleeper] {
            meeting.set_account(Some(account(&s.keys[0])));
            meeting.start_syn(None).await.unwrap();
        }

        let newcomer = SecretKey::generate();
        let tip = s.store.get_best_block_header().unwrap();
        let block = BlockBuilder::new()
            .parent(tip.clone())
            .transactions(vec![Transaction::register(&newcomer, TP)])
            .timestamp(TP)
            .period(0, 2, 1)
            .seal(&s.keys[1]);
        s.store.save_block(&block).unwrap();
        s.pool.add(derive_address(&newcomer.public_key()), newcomer.public_key());
        for meeting in [&s.meeting, &sleeper] {
            meeting.on_changed(0, 1, tip.hash(), block.hash());
        }

        let mut seen = Vec::new();
        for at in [TP, 2 * TP, 4 * TP, 5 * TP, 8 * TP, 11 * TP] {
            s.clock.set(at);
            seen.push(s.meeting.current_round().map(|(start, m)| (start, m.len())));
        }
        assert_eq!(
            seen,
            vec![
                Some((0, 2)),
                Some((2 * TP, 3)),
                Some((2 * TP, 3)),
                Some((5 * TP, 3)),
                Some((8 * TP, 3)),
                Some((11 * TP, 3)),
            ]
        );
        assert_eq!(sleeper.current_round(), s.meeting.current_round());
        assert_eq!(
            sleeper.get_mine_mining_infos().unwrap(),
            s.meeting.get_mine_mining_infos().unwrap()
        );
    }

    #[tokio::test]
    async fn test_timeout_excludes_producers_and_self() {
        let s = setup(3, 0);
        s.meeting.set_account(Some(account(&s.keys[2])));
        s.meeting.start_syn(None).await.unwrap();

        // Member 0 produces in its slot; member 1 stays silent.
        let tip = s.store.get_best_block_header().unwrap();
        let block = BlockBuilder::new()
            .parent(tip)
            .transactions(vec![Transaction::coinbase(
                1,
                derive_address(&s.keys[0].public_key()),
                0,
                11,
                TP,
            )])
            .timestamp(TP)
            .period(0, 3, 0)
            .seal(&s.keys[0]);
        s.store.save_block(&block).unwrap();

        s.clock.set(3 * TP);
        let list = s.meeting.get_timeout_list().unwrap();
        assert_eq!(
            list,
            vec![TimeoutViolation {
                address: derive_address(&s.keys[1].public_key()),
                period_start_point: 0,
            }]
        );

        s.meeting.mark_processed(&list[0]);
        assert!(s.meeting.get_timeout_list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_state_answered_with_round() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[0])));
        s.meeting.start_syn(None).await.unwrap();

        let peer = &s.keys[1];
        let pull = MeetingMessage::pull_state(derive_address(&peer.public_key()), 0, 0).sign(peer);
        let reply = s.meeting.receive_meeting_message(pull.clone()).unwrap().unwrap();
        match reply.kind {
            MeetingKind::RoundState {
                period_start_time,
                members,
                ..
            } => {
                assert_eq!(period_start_time, 0);
                assert_eq!(members.len(), 2);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(s.meeting.ready_members(), 1);
        assert!(s.meeting.get_meeting_message(&pull.hash()).is_some());

        // Seen messages are ignored.
        assert!(s.meeting.receive_meeting_message(pull).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_state_from_non_member_rejected() {
        let s = setup(1, 0);
        s.meeting.start_syn(None).await.unwrap();
        let outsider = SecretKey::generate();
        let pull =
            MeetingMessage::pull_state(derive_address(&outsider.public_key()), 0, 0).sign(&outsider);
        assert!(matches!(
            s.meeting.receive_meeting_message(pull),
            Err(MeetingError::UnknownSender(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_view_adopts_round_state() {
        let s = setup(2, 0);
        s.clock.set(100 * TP + 3);
        s.meeting.set_account(Some(account(&s.keys[0])));
        let hello = MeetingMessage::pull_state(derive_address(&s.keys[0].public_key()), 0, 0)
            .sign(&s.keys[0]);
        s.meeting.start_syn(Some(hello)).await.unwrap();
        assert!(s.meeting.is_stale());
        assert_eq!(s.network.meeting_messages().len(), 1);
        assert!(s.meeting.get_timeout_list().unwrap().is_empty());

        let members: Vec<_> = s.pool.members().into_iter().rev().collect();
        let state = MeetingMessage::round_state(Hash160::ZERO, 0, 99 * TP + 500, TP, members, 0);
        s.meeting.receive_meeting_message(state).unwrap();

        assert!(!s.meeting.is_stale());
        let slot = s.meeting.get_mine_mining_infos().unwrap();
        assert_eq!(slot.period_start_time, 99 * TP + 500);
        assert_eq!(slot.slot_index, 1);
    }

    #[tokio::test]
    async fn test_fresh_view_ignores_round_state() {
        let s = setup(2, 0);
        s.meeting.set_account(Some(account(&s.keys[0])));
        s.meeting.start_syn(None).await.unwrap();

        let state = MeetingMessage::round_state(Hash160::ZERO, 0, 777, TP, s.pool.members(), 0);
        s.meeting.receive_meeting_message(state).unwrap();
        assert_eq!(s.meeting.get_mine_mining_infos().unwrap().period_start_time, 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let s = setup(1, 0);
        s.meeting.start_syn(None).await.unwrap();
        s.meeting.stop();
        s.meeting.stop();
        assert_eq!(s.meeting.status(), MeetingStatus::Stopped);
        assert!(s.meeting.poll_slot().is_none());
        assert!(matches!(
            s.meeting.start_syn(None).await,
            Err(MeetingError::Stopped)
        ));
    }
}
