//! Block production.
//!
//! The mining service:
//! - Waits until the local account is an unlocked pool member and the
//!   network is reachable and synced, then joins the meeting
//! - Drains the mempool one transaction at a time when the local slot opens,
//!   until the generation budget runs out or a stop is requested
//! - Files penalties for members that missed their slot
//! - Re-validates the final candidate set, builds the coinbase last, seals,
//!   commits and announces the block
//!
//! A stop requested at any point before the commit returns every drained
//! transaction to the mempool and persists nothing. Each stop and each start
//! bumps a generation counter; an assembly only commits while the generation
//! it began under is still current, so a restart cannot revive an assembly
//! that a stop already gave up on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use rota_chain::{BlockChangedListener, ChainError, ChainState, Mempool};
use rota_core::{
    Block, BlockBuilder, BlockHash, TimeSource, Transaction, TxKind, TxPayload,
};
use rota_storage::ChainStore;

use crate::meeting::{ConsensusMeeting, MeetingError, MiningSlot};
use crate::message::MeetingMessage;
use crate::traits::{AccountProvider, CreditPolicy, MiningAccount, NetworkHandle};
use crate::violation::ViolationFiler;

/// Configuration for the mining service.
#[derive(Debug, Clone)]
pub struct MiningConfig {
    /// Slot polling interval, also the wait when the mempool is empty.
    pub poll_interval: Duration,
    /// Fallback poll while waiting for eligibility or network readiness.
    pub readiness_poll: Duration,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            readiness_poll: Duration::from_secs(1),
        }
    }
}

/// Mining state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningState {
    Idle,
    WaitingForSlotEligibility,
    WaitingForNetworkReady,
    Scheduled,
    Assembling,
    Committed,
    ForcedStopped,
}

impl fmt::Display for MiningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningState::Idle => write!(f, "idle"),
            MiningState::WaitingForSlotEligibility => write!(f, "waiting_for_slot_eligibility"),
            MiningState::WaitingForNetworkReady => write!(f, "waiting_for_network_ready"),
            MiningState::Scheduled => write!(f, "scheduled"),
            MiningState::Assembling => write!(f, "assembling"),
            MiningState::Committed => write!(f, "committed"),
            MiningState::ForcedStopped => write!(f, "forced_stopped"),
        }
    }
}

/// Errors from block production.
#[derive(Debug, thiserror::Error)]
pub enum MiningError {
    #[error("mining stopped")]
    Stopped,

    #[error("no unlocked mining account")]
    NoAccount,

    #[error("assembly aborted, {requeued} transactions returned to the mempool")]
    Aborted { requeued: usize },

    #[error("assembled block failed verification: {0}")]
    InvalidBlock(String),

    #[error("meeting error: {0}")]
    Meeting(#[from] MeetingError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiningStats {
    pub blocks_produced: u64,
    /// Assemblies ended by a forced stop.
    pub aborted: u64,
    /// Slots abandoned on verification or persistence failure.
    pub failed: u64,
    pub penalties_filed: u64,
}

#[derive(Default)]
struct Counters {
    blocks_produced: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    penalties_filed: AtomicU64,
}

/// Wakes a waiting mining service whenever the tip changes.
struct WakeOnBlock(Arc<Notify>);

impl BlockChangedListener for WakeOnBlock {
    fn on_changed(&self, _old_height: u64, _new_height: u64, _old_hash: BlockHash, _new_hash: BlockHash) {
        self.0.notify_waiters();
    }
}

/// Block production service.
pub struct MiningService<S: ChainStore> {
    config: MiningConfig,
    chain: Arc<ChainState<S>>,
    meeting: Arc<ConsensusMeeting<S>>,
    network: Arc<dyn NetworkHandle>,
    accounts: Arc<dyn AccountProvider>,
    credit: Arc<dyn CreditPolicy>,
    clock: Arc<dyn TimeSource>,
    filer: ViolationFiler<S>,
    account: RwLock<Option<MiningAccount>>,
    state: Arc<Mutex<MiningState>>,
    stop_requested: AtomicBool,
    stop_complete: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    wake: Arc<Notify>,
    counters: Counters,
}

impl<S: ChainStore + 'static> MiningService<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MiningConfig,
        chain: Arc<ChainState<S>>,
        meeting: Arc<ConsensusMeeting<S>>,
        network: Arc<dyn NetworkHandle>,
        accounts: Arc<dyn AccountProvider>,
        credit: Arc<dyn CreditPolicy>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let filer = ViolationFiler::new(chain.store().clone());
        Self {
            config,
            chain,
            meeting,
            network,
            accounts,
            credit,
            clock,
            filer,
            account: RwLock::new(None),
            state: Arc::new(Mutex::new(MiningState::Idle)),
            stop_requested: AtomicBool::new(false),
            stop_complete: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            wake: Arc::new(Notify::new()),
            counters: Counters::default(),
        }
    }

    pub fn status(&self) -> MiningState {
        *self.state.lock()
    }

    pub fn stats(&self) -> MiningStats {
        MiningStats {
            blocks_produced: self.counters.blocks_produced.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            penalties_filed: self.counters.penalties_filed.load(Ordering::Relaxed),
        }
    }

    pub fn filer(&self) -> &ViolationFiler<S> {
        &self.filer
    }

    /// Listener to register on the chain so waits end as soon as a block lands.
    pub fn block_listener(&self) -> Arc<dyn BlockChangedListener> {
        Arc::new(WakeOnBlock(self.wake.clone()))
    }

    /// Interrupt any readiness wait for an immediate re-check.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Whether a requested stop has taken effect.
    pub fn is_stop_complete(&self) -> bool {
        self.stop_complete.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: MiningState) {
        *self.state.lock() = state;
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether the assembly that began under `generation` must give up.
    fn assembly_stopped(&self, generation: u64) -> bool {
        self.stopping() || self.generation.load(Ordering::SeqCst) != generation
    }

    /// Wait for a wake-up or `timeout`, whichever comes first.
    async fn pause(&self, timeout: Duration) -> Result<(), MiningError> {
        if self.stopping() {
            return Err(MiningError::Stopped);
        }
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        if self.stopping() {
            return Err(MiningError::Stopped);
        }
        Ok(())
    }

    /// Wait for eligibility and network readiness, then join the meeting.
    pub async fn start(&self) -> Result<(), MiningError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stop_complete.store(false, Ordering::SeqCst);

        let account = self.reset().await?;

        self.set_state(MiningState::WaitingForNetworkReady);
        while !(self.network.can_broadcast() && self.network.is_synced()) {
            self.pause(self.config.readiness_poll).await?;
        }

        let secret = account.secret().ok_or(MiningError::NoAccount)?;
        let height = self.chain.height()?;
        let hello =
            MeetingMessage::pull_state(account.address, height, self.clock.current_time_millis())
                .sign(secret);
        self.meeting.start_syn(Some(hello)).await?;

        self.set_state(MiningState::Idle);
        info!(address = %account.address, height, "Mining service started");
        Ok(())
    }

    /// Wait until the local account is an unlocked pool member, then hand its
    /// public identity to the meeting.
    pub async fn reset(&self) -> Result<MiningAccount, MiningError> {
        self.set_state(MiningState::WaitingForSlotEligibility);
        loop {
            if let Some(account) = self.accounts.mining_account() {
                if !account.is_locked() && self.chain.pool().contains(&account.address) {
                    self.meeting.set_account(Some(account.public_view()));
                    *self.account.write() = Some(account.clone());
                    debug!(address = %account.address, "Mining account eligible");
                    return Ok(account);
                }
            }
            self.pause(self.config.readiness_poll).await?;
        }
    }

    /// Abort any assembly in progress and halt the service.
    ///
    /// If the assembly loop has not acknowledged the stop after one slot
    /// length, the stop is completed anyway.
    pub fn stop_mining(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.wake.notify_waiters();

        if self.status() != MiningState::Assembling {
            self.stop_complete.store(true, Ordering::SeqCst);
            self.set_state(MiningState::ForcedStopped);
            info!("Mining stopped");
            return;
        }

        self.stop_complete.store(false, Ordering::SeqCst);
        let timeout = self.chain.params().time_period;
        let (state, complete) = (self.state.clone(), self.stop_complete.clone());
        let current = self.generation.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    // A later start owns the flags now.
                    if current.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    if !complete.swap(true, Ordering::SeqCst) {
                        warn!(?timeout, "Assembly did not acknowledge stop, forcing it");
                        *state.lock() = MiningState::ForcedStopped;
                    }
                });
            }
            Err(_) => {
                complete.store(true, Ordering::SeqCst);
                *state.lock() = MiningState::ForcedStopped;
            }
        }
    }

    /// Return `candidate` to the mempool and complete the stop, unless the
    /// service was restarted since the stop that ended this assembly.
    fn abort(&self, generation: u64, candidate: Vec<Transaction>) -> MiningError {
        let requeued = self.chain.mempool().requeue(candidate);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        if self.stopping() {
            self.stop_complete.store(true, Ordering::SeqCst);
            self.set_state(MiningState::ForcedStopped);
            info!(requeued, "Block assembly aborted");
        } else {
            warn!(requeued, generation, "Stale block assembly discarded after restart");
        }
        MiningError::Aborted { requeued }
    }

    /// Give up the slot, keeping the candidate's transactions pending.
    fn abandon(&self, candidate: Vec<Transaction>) -> usize {
        let requeued = self.chain.mempool().requeue(candidate);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.set_state(MiningState::Idle);
        requeued
    }

    fn parent_pending(tx: &Transaction, mempool: &Mempool) -> bool {
        tx.inputs.iter().any(|i| mempool.contains(&i.outpoint.tx))
    }

    /// Assemble, commit and announce a block for `slot`.
    pub async fn mining(&self, slot: MiningSlot) -> Result<Block, MiningError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let account = self.account.read().clone().ok_or(MiningError::NoAccount)?;
        let secret = account.secret().cloned().ok_or(MiningError::NoAccount)?;
        let params = self.chain.params().clone();
        let mempool = self.chain.mempool().clone();
        let validator = self.chain.validator().clone();

        let tip = self.chain.best_header()?;
        let height = tip.height + 1;
        let deadline = (slot.begin_time + params.block_gen_millis()).min(slot.end_time);
        self.set_state(MiningState::Assembling);
        debug!(height, begin = slot.begin_time, deadline, "Assembling block");

        let mut candidate: Vec<Transaction> = Vec::new();
        let mut fees: i64 = 0;

        loop {
            if self.assembly_stopped(generation) {
                return Err(self.abort(generation, candidate));
            }
            if self.clock.current_time_millis() >= deadline {
                break;
            }
            let Some(tx) = mempool.get() else {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            match validator.validate(&tx, &candidate) {
                Ok(()) => match tx.fee() {
                    Ok(fee) => {
                        fees += fee;
                        candidate.push(tx);
                    }
                    Err(e) => debug!(tx = %tx.id(), error = %e, "Dropped transaction"),
                },
                Err(rejection)
                    if rejection.is_ordering_deferral() && Self::parent_pending(&tx, &mempool) =>
                {
                    debug!(tx = %tx.id(), "Deferred transaction until its parent is packaged");
                    mempool.add(tx);
                }
                Err(rejection) => {
                    debug!(tx = %tx.id(), reason = %rejection, "Dropped transaction");
                }
            }
        }

        let timestamp = slot.end_time;
        match self.meeting.get_timeout_list() {
            Ok(violations) => {
                for violation in violations {
                    if let Some(penalty) = self.filer.file(violation.evidence(), &secret, timestamp) {
                        candidate.push(penalty);
                    }
                    self.meeting.mark_processed(&violation);
                }
            }
            Err(e) => warn!(error = %e, "Timeout list unavailable"),
        }

        // Final re-validation; a dropped payment refunds its provisional fee.
        let mut kept: Vec<Transaction> = Vec::with_capacity(candidate.len());
        for tx in candidate {
            match validator.validate(&tx, &kept) {
                Ok(()) => kept.push(tx),
                Err(rejection) => {
                    let refund = tx.fee().unwrap_or(0);
                    fees -= refund;
                    if let TxPayload::Violation { evidence } = &tx.payload {
                        self.filer.forget(&evidence.id());
                    }
                    warn!(tx = %tx.id(), reason = %rejection, refund, "Dropped transaction at final validation");
                }
            }
        }

        let credits: Vec<Transaction> = kept
            .iter()
            .filter(|tx| tx.kind() == TxKind::Payment)
            .filter_map(|tx| {
                let amount = self.credit.credit_for(tx, height)?;
                let payer = tx.signer()?;
                Some(Transaction::credit(payer, amount, tx.id(), &secret, timestamp))
            })
            .collect();
        for credit in credits {
            match validator.validate(&credit, &kept) {
                Ok(()) => kept.push(credit),
                Err(rejection) => debug!(reason = %rejection, "Credit not granted"),
            }
        }

        let penalties = kept
            .iter()
            .filter(|tx| tx.kind() == TxKind::Violation)
            .count() as u64;
        let coinbase = Transaction::coinbase(
            height,
            account.address,
            fees + params.block_reward(height),
            params.coinbase_lock_time(height),
            timestamp,
        );
        let mut transactions = Vec::with_capacity(kept.len() + 1);
        transactions.push(coinbase);
        transactions.extend(kept);

        let block = BlockBuilder::new()
            .parent(tip.clone())
            .transactions(transactions)
            .timestamp(timestamp)
            .period(slot.period_start_time, slot.period_count, slot.slot_index)
            .seal(&secret);
        debug_assert_eq!(block.total_fees().ok(), Some(fees));

        if let Err(e) = block.validate(Some(&tip)) {
            let requeued = self.abandon(block.transactions[1..].to_vec());
            error!(height, error = %e, requeued, "Assembled block failed verification");
            return Err(MiningError::InvalidBlock(e.to_string()));
        }

        if self.assembly_stopped(generation) {
            return Err(self.abort(generation, block.transactions[1..].to_vec()));
        }

        if let Err(e) = self.chain.commit_block(&block) {
            let requeued = self.abandon(block.transactions[1..].to_vec());
            error!(height, error = %e, requeued, "Failed to persist block, slot abandoned");
            return Err(e.into());
        }

        self.network.announce_block(&block).await;
        self.counters.blocks_produced.fetch_add(1, Ordering::Relaxed);
        self.counters
            .penalties_filed
            .fetch_add(penalties, Ordering::Relaxed);
        self.set_state(MiningState::Committed);
        info!(
            height,
            txs = block.transactions.len(),
            fees,
            penalties,
            hash = %block.hash(),
            "Produced block"
        );
        Ok(block)
    }

    /// Run until shutdown: join the meeting, then mine whenever the local slot
    /// opens.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<(), MiningError> {
        tokio::select! {
            started = self.start() => started?,
            _ = shutdown.recv() => {
                self.stop_mining();
                return Ok(());
            }
        }

        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Mining service shutting down");
                    self.stop_mining();
                    self.meeting.stop();
                    break;
                }
                _ = ticker.tick() => {
                    if self.stopping() {
                        break;
                    }
                    let evicted = self.chain.mempool().evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "Evicted expired transactions");
                    }

                    let Some(slot) = self.meeting.poll_slot() else {
                        continue;
                    };
                    self.set_state(MiningState::Scheduled);
                    match self.mining(slot).await {
                        Ok(_) => {}
                        Err(MiningError::Aborted { .. }) => break,
                        Err(e) => warn!(error = %e, "Slot produced no block"),
                    }
                }
            }
        }
        Ok(())
    }
}
