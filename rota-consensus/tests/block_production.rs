//! Integration tests for slot scheduling and block production.
//!
//! These tests drive the meeting and the mining service against an in-memory
//! chain with a manually advanced clock.

use std::sync::Arc;
use std::time::Duration;

use rota_chain::{ChainState, ChainValidator, ConsensusPool, Mempool};
use rota_consensus::mock::{MockNetwork, StaticAccount};
use rota_consensus::{
    ConsensusMeeting, CreditPolicy, MeetingConfig, MiningAccount, MiningConfig, MiningError,
    MiningService, MiningSlot, MiningState, NoCredit,
};
use rota_core::{
    derive_address, hash, Block, BlockBuilder, BlockHash, ChainParams, Hash160, MockClock,
    OutPoint, SecretKey, Transaction, TxInput, TxKind, TxOutput, TxPayload, ViolationEvidence,
};
use rota_storage::{
    BatchWriter, BlockStore, ChainStore, MemoryStore, StateStore, StorageBatch, TxRecord,
};

const GENESIS: i64 = 1_000_000;
const TP: i64 = 10_000;
const GEN: i64 = 6_000;
const FUNDING_OUTPUTS: u32 = 6;

struct Harness {
    keys: Vec<SecretKey>,
    local: SecretKey,
    store: Arc<MemoryStore>,
    chain: Arc<ChainState<MemoryStore>>,
    clock: Arc<MockClock>,
    network: Arc<MockNetwork>,
    meeting: Arc<ConsensusMeeting<MemoryStore>>,
    service: Arc<MiningService<MemoryStore>>,
    funding: Transaction,
}

impl Harness {
    fn address(&self, index: usize) -> Hash160 {
        derive_address(&self.keys[index].public_key())
    }

    fn local_address(&self) -> Hash160 {
        derive_address(&self.local.public_key())
    }

    /// Spend funding output `index` back to the local account.
    fn payment(&self, index: u32, out: i64) -> Transaction {
        Transaction::payment(
            vec![TxInput {
                outpoint: OutPoint::new(self.funding.id(), index),
                value: 100,
            }],
            vec![TxOutput {
                value: out,
                recipient: self.local_address(),
            }],
            index as i64,
        )
        .sign(&self.local)
    }

    /// Spend output 0 of `parent`.
    fn child_of(&self, parent: &Transaction, out: i64) -> Transaction {
        Transaction::payment(
            vec![TxInput {
                outpoint: OutPoint::new(parent.id(), 0),
                value: parent.outputs[0].value,
            }],
            vec![TxOutput {
                value: out,
                recipient: self.local_address(),
            }],
            99,
        )
        .sign(&self.local)
    }

    /// Run one production for `slot`, releasing the deadline after the
    /// mempool has been drained.
    async fn produce(&self, slot: MiningSlot) -> Result<Block, MiningError> {
        let service = self.service.clone();
        let task = tokio::spawn(async move { service.mining(slot).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.clock.set(slot.begin_time + GEN);
        task.await.expect("mining task panicked")
    }
}

/// `members` registered accounts, `local` producing for this node.
async fn harness(members: usize, local: usize) -> Harness {
    let keys: Vec<_> = (0..members).map(|_| SecretKey::generate()).collect();
    let local_key = keys[local].clone();
    let me = derive_address(&local_key.public_key());

    let genesis = BlockBuilder::new()
        .transactions(keys.iter().map(|k| Transaction::register(k, 0)).collect())
        .timestamp(GENESIS)
        .seal(&keys[0]);
    let store = Arc::new(MemoryStore::with_genesis(&genesis).unwrap());

    // Spendable outputs for the local account; stored directly.
    let mut funding = Transaction::coinbase(1, me, 0, 0, GENESIS);
    funding.outputs = (0..FUNDING_OUTPUTS)
        .map(|_| TxOutput {
            value: 100,
            recipient: me,
        })
        .collect();
    let block1 = BlockBuilder::new()
        .parent(genesis.header.clone())
        .transactions(vec![funding.clone()])
        .timestamp(GENESIS)
        .seal(&keys[0]);
    store.save_block(&block1).unwrap();

    let params = ChainParams {
        genesis_time: GENESIS,
        time_period: Duration::from_millis(TP as u64),
        block_gen_time: Duration::from_millis(GEN as u64),
        ..Default::default()
    };
    let pool = Arc::new(ConsensusPool::load(store.consensus_accounts().unwrap()));
    let mempool = Arc::new(Mempool::default_config());
    let validator = Arc::new(ChainValidator::new(store.clone(), pool.clone()));
    let chain = Arc::new(ChainState::new(
        store.clone(),
        pool.clone(),
        mempool,
        validator,
        params.clone(),
    ));

    let clock = Arc::new(MockClock::new(GENESIS));
    let network = Arc::new(MockNetwork::ready());
    let meeting = Arc::new(ConsensusMeeting::new(
        MeetingConfig::default(),
        params,
        store.clone(),
        pool,
        clock.clone(),
        network.clone(),
    ));
    chain.add_listener(meeting.clone());

    let accounts = Arc::new(StaticAccount::new(Some(MiningAccount::unlocked(
        local_key.clone(),
    ))));
    let service = Arc::new(MiningService::new(
        MiningConfig::default(),
        chain.clone(),
        meeting.clone(),
        network.clone(),
        accounts,
        Arc::new(NoCredit),
        clock.clone(),
    ));
    chain.add_listener(service.block_listener());
    service.start().await.unwrap();

    Harness {
        keys,
        local: local_key,
        store,
        chain,
        clock,
        network,
        meeting,
        service,
        funding,
    }
}

fn violation_targets(block: &Block) -> Vec<(Hash160, i64)> {
    block
        .transactions
        .iter()
        .filter_map(|tx| match &tx.payload {
            TxPayload::Violation {
                evidence: ViolationEvidence::NotBroadcast(e),
            } => Some((e.address, e.period_start_time)),
            _ => None,
        })
        .collect()
}

// === Scenario 1: Silent Slot Holder ===

#[tokio::test(start_paused = true)]
async fn integration_silent_member_reported_once() {
    let h = harness(3, 2).await;
    assert_eq!(h.network.meeting_messages().len(), 1);

    h.clock.set(GENESIS + TP);
    let timeouts = h.meeting.get_timeout_list().unwrap();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].address, h.address(0));
    assert_eq!(timeouts[0].period_start_point, GENESIS);

    // Local slot: both silent members are penalized in the block.
    h.clock.set(GENESIS + 2 * TP);
    let slot = h.meeting.poll_slot().unwrap();
    assert_eq!(slot.slot_index, 2);
    let block = h.produce(slot).await.unwrap();

    let mut targets = violation_targets(&block);
    targets.sort();
    let mut expected = vec![(h.address(0), GENESIS), (h.address(1), GENESIS)];
    expected.sort();
    assert_eq!(targets, expected);
    assert_eq!(h.service.stats().penalties_filed, 2);
    assert!(h.meeting.get_timeout_list().unwrap().is_empty());
}

// === Scenario 2: Assembly From Mempool ===

#[tokio::test(start_paused = true)]
async fn integration_block_packs_valid_transactions() {
    let h = harness(2, 0).await;
    let mempool = h.chain.mempool().clone();
    let first = h.payment(0, 90);
    let second = h.payment(1, 95);
    let mut negative = h.payment(2, 90);
    negative.outputs[0].value = -5;
    let negative = negative.sign(&h.local);

    mempool.add(first.clone());
    mempool.add(negative);
    mempool.add(second.clone());

    let slot = h.meeting.poll_slot().unwrap();
    assert_eq!(slot.begin_time, GENESIS);
    let block = h.produce(slot).await.unwrap();

    assert_eq!(block.transactions.len(), 3);
    assert_eq!(block.transactions[0].kind(), TxKind::Coinbase);
    assert_eq!(block.transactions[1].id(), first.id());
    assert_eq!(block.transactions[2].id(), second.id());
    assert_eq!(block.header.period_start_time, GENESIS);
    assert_eq!(block.header.slot_index, 0);
    assert_eq!(block.header.timestamp, slot.end_time);

    assert_eq!(h.store.get_best_block_header().unwrap().hash(), block.hash());
    assert_eq!(h.network.announced(), vec![block.hash()]);
    assert!(mempool.is_empty());
    assert_eq!(h.service.status(), MiningState::Committed);
    assert_eq!(h.service.stats().blocks_produced, 1);
}

#[tokio::test(start_paused = true)]
async fn integration_coinbase_claims_fees_and_reward() {
    let h = harness(2, 0).await;
    h.chain.mempool().add(h.payment(0, 90));
    h.chain.mempool().add(h.payment(1, 75));

    let slot = h.meeting.poll_slot().unwrap();
    let block = h.produce(slot).await.unwrap();

    let params = h.chain.params();
    let coinbase = block.coinbase().unwrap();
    assert_eq!(block.total_fees().unwrap(), 35);
    assert_eq!(
        coinbase.output_value().unwrap(),
        35 + params.block_reward(block.height())
    );
    assert_eq!(coinbase.outputs[0].recipient, h.local_address());
    assert_eq!(coinbase.lock_time, params.coinbase_lock_time(block.height()));

    // A peer on the same chain accepts it under the full rules.
    let genesis = h.store.get_block_at(0).unwrap().unwrap();
    let block1 = h.store.get_block_at(1).unwrap().unwrap();
    let peer_store = Arc::new(MemoryStore::with_genesis(&genesis).unwrap());
    peer_store.save_block(&block1).unwrap();
    let peer_pool = Arc::new(ConsensusPool::load(peer_store.consensus_accounts().unwrap()));
    let peer = ChainState::new(
        peer_store.clone(),
        peer_pool.clone(),
        Arc::new(Mempool::default_config()),
        Arc::new(ChainValidator::new(peer_store, peer_pool)),
        params.clone(),
    );
    assert_eq!(peer.accept_block(&block).unwrap().height, block.height());
}

#[tokio::test(start_paused = true)]
async fn integration_child_follows_parent() {
    let h = harness(2, 0).await;
    let parent = h.payment(0, 90);
    let child = h.child_of(&parent, 80);

    // Child arrives first.
    h.chain.mempool().add(child.clone());
    h.chain.mempool().add(parent.clone());

    let slot = h.meeting.poll_slot().unwrap();
    let block = h.produce(slot).await.unwrap();

    let ids = block.tx_ids();
    let parent_at = ids.iter().position(|id| *id == parent.id()).unwrap();
    let child_at = ids.iter().position(|id| *id == child.id()).unwrap();
    assert!(parent_at < child_at);
    assert_eq!(block.total_fees().unwrap(), 20);
}

// === Scenario 3: Forced Stop ===

#[tokio::test(start_paused = true)]
async fn integration_forced_stop_requeues_everything() {
    let h = harness(2, 0).await;
    let mempool = h.chain.mempool().clone();
    let txs: Vec<_> = (0..4).map(|i| h.payment(i, 90)).collect();
    for tx in &txs {
        mempool.add(tx.clone());
    }
    let blocks_before = h.store.block_count();

    let slot = h.meeting.poll_slot().unwrap();
    let service = h.service.clone();
    let task = tokio::spawn(async move { service.mining(slot).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(mempool.is_empty());
    assert_eq!(h.service.status(), MiningState::Assembling);

    h.service.stop_mining();
    let result = task.await.unwrap();

    assert!(matches!(result, Err(MiningError::Aborted { requeued: 4 })));
    assert_eq!(mempool.len(), 4);
    for tx in &txs {
        assert!(mempool.contains(&tx.id()));
    }
    assert_eq!(mempool.get().map(|tx| tx.id()), Some(txs[0].id()));
    assert_eq!(h.store.block_count(), blocks_before);
    assert!(h.network.announced().is_empty());
    assert!(h.service.is_stop_complete());
    assert_eq!(h.service.status(), MiningState::ForcedStopped);
    assert_eq!(h.service.stats().aborted, 1);
}

#[tokio::test(start_paused = true)]
async fn integration_failed_commit_keeps_transactions() {
    let h = harness(2, 0).await;
    let tx = h.payment(0, 90);
    h.chain.mempool().add(tx.clone());
    h.store.set_fail_writes(true);

    let slot = h.meeting.poll_slot().unwrap();
    let result = h.produce(slot).await;

    assert!(matches!(result, Err(MiningError::Chain(_))));
    assert!(h.chain.mempool().contains(&tx.id()));
    assert!(h.network.announced().is_empty());
    assert_eq!(h.service.stats().failed, 1);
}

// === Scenario 4: Evidence Idempotency ===

#[tokio::test(start_paused = true)]
async fn integration_evidence_filed_once_across_slots() {
    let h = harness(3, 2).await;

    h.clock.set(GENESIS + 2 * TP);
    let first = h.produce(h.meeting.poll_slot().unwrap()).await.unwrap();
    let first_targets = violation_targets(&first);
    assert_eq!(first_targets.len(), 2);

    for (address, start) in &first_targets {
        let evidence = ViolationEvidence::not_broadcast(*address, *start);
        assert!(h.store.has_evidence(&evidence.id()).unwrap());
        assert!(h.service.filer().file(evidence, &h.local, 0).is_none());
    }

    // Next round: the same members stay silent.
    h.clock.set(GENESIS + 5 * TP);
    let second = h.produce(h.meeting.poll_slot().unwrap()).await.unwrap();
    let second_targets = violation_targets(&second);

    assert_eq!(second_targets.len(), 2);
    assert!(second_targets
        .iter()
        .all(|(_, start)| *start == GENESIS + 3 * TP));
    assert!(second_targets.iter().all(|t| !first_targets.contains(t)));
    assert_eq!(second.height(), first.height() + 1);
}

#[tokio::test(start_paused = true)]
async fn integration_waits_for_eligibility() {
    let h = harness(2, 0).await;

    // An outsider never becomes eligible; stopping ends the wait.
    let outsider = Arc::new(StaticAccount::new(Some(MiningAccount::unlocked(
        SecretKey::generate(),
    ))));
    let service = Arc::new(MiningService::new(
        MiningConfig::default(),
        h.chain.clone(),
        h.meeting.clone(),
        h.network.clone(),
        outsider,
        Arc::new(NoCredit),
        h.clock.clone(),
    ));
    let waiting = service.clone();
    let task = tokio::spawn(async move { waiting.start().await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(service.status(), MiningState::WaitingForSlotEligibility);

    service.stop_mining();
    assert!(matches!(task.await.unwrap(), Err(MiningError::Stopped)));
}

// === Scenario 5: Final Re-validation ===

#[tokio::test(start_paused = true)]
async fn integration_final_validation_refunds_and_forgets() {
    let h = harness(3, 2).await;
    h.clock.set(GENESIS + 2 * TP);

    let confirmed = h.payment(0, 90);
    let kept = h.payment(1, 95);
    // Another member already reported member 0 for the same round.
    let evidence = ViolationEvidence::not_broadcast(h.address(0), GENESIS);
    let reported = Transaction::violation(evidence, &h.keys[1], GENESIS + 2 * TP);
    let mempool = h.chain.mempool().clone();
    mempool.add(confirmed.clone());
    mempool.add(kept.clone());
    mempool.add(reported.clone());

    let slot = h.meeting.poll_slot().unwrap();
    let service = h.service.clone();
    let task = tokio::spawn(async move { service.mining(slot).await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(mempool.is_empty());

    // A block elsewhere confirms one candidate while assembly runs.
    let mut batch = StorageBatch::new();
    batch
        .mark_spent(confirmed.inputs[0].outpoint, confirmed.id())
        .put_transaction(TxRecord {
            tx: confirmed.clone(),
            height: 1,
            block: BlockHash(hash(b"peer block")),
        });
    h.store.commit(batch).unwrap();

    h.clock.set(slot.begin_time + GEN);
    let block = task.await.unwrap().unwrap();

    let ids = block.tx_ids();
    assert!(!ids.contains(&confirmed.id()));
    assert!(ids.contains(&kept.id()));
    assert!(ids.contains(&reported.id()));
    assert!(!mempool.contains(&confirmed.id()));

    // Only the kept payment's fee is claimed.
    let reward = h.chain.params().block_reward(block.height());
    assert_eq!(block.total_fees().unwrap(), 5);
    assert_eq!(block.coinbase().unwrap().output_value().unwrap(), 5 + reward);

    // Member 0 is penalized once, through the peer's report; the local
    // filing for it was dropped and forgotten.
    let mut targets = violation_targets(&block);
    targets.sort();
    let mut expected = vec![(h.address(0), GENESIS), (h.address(1), GENESIS)];
    expected.sort();
    assert_eq!(targets, expected);
    assert_eq!(h.service.filer().pending(), 1);
    assert_eq!(h.service.stats().penalties_filed, 2);
}

// === Scenario 6: Credit Emission ===

/// Credits every payment that pays a fee.
struct FeeCredit(u64);

impl CreditPolicy for FeeCredit {
    fn credit_for(&self, tx: &Transaction, _height: u64) -> Option<u64> {
        (tx.fee().ok()? > 0).then_some(self.0)
    }
}

#[tokio::test(start_paused = true)]
async fn integration_credit_emitted_and_fees_conserved() {
    let h = harness(2, 0).await;
    h.service.stop_mining();

    let accounts = Arc::new(StaticAccount::new(Some(MiningAccount::unlocked(
        h.local.clone(),
    ))));
    let service = Arc::new(MiningService::new(
        MiningConfig::default(),
        h.chain.clone(),
        h.meeting.clone(),
        h.network.clone(),
        accounts,
        Arc::new(FeeCredit(7)),
        h.clock.clone(),
    ));
    service.start().await.unwrap();

    let paying = h.payment(0, 80);
    let free = h.payment(1, 100);
    h.chain.mempool().add(paying.clone());
    h.chain.mempool().add(free.clone());

    let slot = h.meeting.poll_slot().unwrap();
    let producer = service.clone();
    let task = tokio::spawn(async move { producer.mining(slot).await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.clock.set(slot.begin_time + GEN);
    let block = task.await.unwrap().unwrap();

    let credits: Vec<_> = block
        .transactions
        .iter()
        .filter_map(|tx| match &tx.payload {
            TxPayload::Credit {
                payer,
                amount,
                source,
            } => Some((*payer, *amount, *source, tx.signer())),
            _ => None,
        })
        .collect();
    assert_eq!(
        credits,
        vec![(
            h.local_address(),
            7,
            paying.id(),
            Some(h.local_address())
        )]
    );

    // Credits move no value: the coinbase claims exactly the payment fees.
    let reward = h.chain.params().block_reward(block.height());
    assert_eq!(block.total_fees().unwrap(), 20);
    assert_eq!(block.coinbase().unwrap().output_value().unwrap(), 20 + reward);
    assert_eq!(h.store.get_best_block_header().unwrap().hash(), block.hash());
}
