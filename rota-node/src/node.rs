//! Construction and lifecycle of a full node.
//!
//! Every per-process singleton (store, pool, mempool, clock, peer set) is
//! built once here and handed down as an `Arc`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rota_chain::{ChainState, ChainValidator, ConsensusPool, Mempool};
use rota_consensus::{ConsensusMeeting, MiningService, NoCredit};
use rota_core::{Block, BlockBuilder, NetworkClock, SecretKey, Transaction};
use rota_net::{MessageDispatcher, PeerChannel, PeerManager};
use rota_storage::{MemoryStore, StateStore};

use crate::account::NodeAccount;
use crate::config::NodeConfig;
use crate::error::NodeError;

/// A genesis block registering every key in `members`, sealed by the first.
pub fn create_genesis(members: &[SecretKey], timestamp: i64) -> Result<Block, NodeError> {
    let sealer = members
        .first()
        .ok_or_else(|| NodeError::Genesis("at least one member is required".into()))?;
    Ok(BlockBuilder::new()
        .transactions(
            members
                .iter()
                .map(|key| Transaction::register(key, timestamp))
                .collect(),
        )
        .timestamp(timestamp)
        .seal(sealer))
}

/// Write `genesis` as hex-encoded bincode.
pub fn write_genesis(genesis: &Block, path: impl AsRef<Path>) -> Result<(), NodeError> {
    let bytes = bincode::serialize(genesis)?;
    std::fs::write(path, hex::encode(bytes))?;
    Ok(())
}

/// Read and check a genesis file written by [`write_genesis`].
pub fn load_genesis(path: impl AsRef<Path>) -> Result<Block, NodeError> {
    let text = std::fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim()).map_err(|e| NodeError::Genesis(e.to_string()))?;
    let genesis: Block =
        bincode::deserialize(&bytes).map_err(|e| NodeError::Genesis(e.to_string()))?;
    genesis
        .validate(None)
        .map_err(|e| NodeError::Genesis(e.to_string()))?;
    Ok(genesis)
}

/// A wired node.
pub struct Node {
    config: NodeConfig,
    store: Arc<MemoryStore>,
    chain: Arc<ChainState<MemoryStore>>,
    clock: Arc<NetworkClock>,
    network: Arc<PeerManager>,
    meeting: Arc<ConsensusMeeting<MemoryStore>>,
    dispatcher: Arc<MessageDispatcher<MemoryStore>>,
    mining: Option<Arc<MiningService<MemoryStore>>>,
}

impl Node {
    pub fn build(config: NodeConfig, genesis: &Block) -> Result<Self, NodeError> {
        config.validate()?;
        genesis
            .validate(None)
            .map_err(|e| NodeError::Genesis(e.to_string()))?;

        let params = config.chain.clone();
        let store = Arc::new(MemoryStore::with_genesis(genesis)?);
        let pool = Arc::new(ConsensusPool::load(store.consensus_accounts()?));
        let mempool = Arc::new(Mempool::new(config.mempool_config()));
        let validator = Arc::new(ChainValidator::new(store.clone(), pool.clone()));
        let chain = Arc::new(ChainState::new(
            store.clone(),
            pool.clone(),
            mempool,
            validator,
            params.clone(),
        ));

        let clock = Arc::new(NetworkClock::new());
        let network = Arc::new(PeerManager::new(config.network_config()?, clock.clone()));
        network.set_local_height(chain.height()?);
        chain.add_listener(network.clone());

        let meeting = Arc::new(ConsensusMeeting::new(
            config.meeting_config(),
            params,
            store.clone(),
            pool.clone(),
            clock.clone(),
            network.clone(),
        ));
        chain.add_listener(meeting.clone());

        let mining = match NodeAccount::from_config(&config)? {
            Some(account) => {
                debug!(?account, "Mining enabled");
                let accounts = Arc::new(account);
                let service = Arc::new(MiningService::new(
                    config.mining_config(),
                    chain.clone(),
                    meeting.clone(),
                    network.clone(),
                    accounts,
                    Arc::new(NoCredit),
                    clock.clone(),
                ));
                chain.add_listener(service.block_listener());
                Some(service)
            }
            None => None,
        };

        let dispatcher = Arc::new(MessageDispatcher::new(
            chain.clone(),
            meeting.clone(),
            network.clone(),
        ));

        info!(
            chain_id = %config.chain.chain_id,
            genesis = %genesis.hash(),
            members = pool.len(),
            mining = mining.is_some(),
            "Node built"
        );

        Ok(Self {
            config,
            store,
            chain,
            clock,
            network,
            meeting,
            dispatcher,
            mining,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn chain(&self) -> &Arc<ChainState<MemoryStore>> {
        &self.chain
    }

    pub fn clock(&self) -> &Arc<NetworkClock> {
        &self.clock
    }

    pub fn network(&self) -> &Arc<PeerManager> {
        &self.network
    }

    pub fn meeting(&self) -> &Arc<ConsensusMeeting<MemoryStore>> {
        &self.meeting
    }

    pub fn mining(&self) -> Option<&Arc<MiningService<MemoryStore>>> {
        self.mining.as_ref()
    }

    /// Dial a peer and start the handshake.
    pub async fn connect(&self, addr: &str) -> Result<Arc<PeerChannel>, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = self
            .network
            .attach(stream, addr, self.dispatcher.clone())
            .await?;
        Ok(peer)
    }

    /// Serve connections, dial configured peers and produce blocks until
    /// `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, height = self.chain.height()?, "Listening");

        let network = self.network.clone();
        let dispatcher = self.dispatcher.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = network
                            .attach(stream, addr.to_string(), dispatcher.clone())
                            .await
                        {
                            warn!(peer = %addr, error = %e, "Inbound connection rejected");
                        }
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        });

        for addr in &self.config.peers {
            if let Err(e) = self.connect(addr).await {
                warn!(peer = %addr, error = %e, "Dial failed");
            }
        }

        let network = self.network.clone();
        let ping_interval = self.config.network.ping_interval;
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            loop {
                ticker.tick().await;
                network.ping_all();
            }
        });

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let miner = self
            .mining
            .clone()
            .map(|service| tokio::spawn(async move { service.run(stop_rx).await }));

        shutdown.await;
        info!("Shutting down");

        if let Some(handle) = miner {
            let _ = stop_tx.send(()).await;
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Mining stopped with error"),
                Err(e) => warn!(error = %e, "Mining task failed"),
            }
        }
        acceptor.abort();
        pinger.abort();
        for peer in self.network.peers() {
            self.network.remove_peer(peer.id());
        }
        Ok(())
    }
}
