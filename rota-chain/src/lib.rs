//! Chain operations for rota.
//!
//! This crate keeps the chain and everything that must agree with it:
//! - Chain state (tip, block acceptance, block-changed notifications)
//! - Consensus pool (registered producers in slot order)
//! - Mempool (pending transactions, FIFO with front re-insertion)
//! - Transaction validation against chain state and block context
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Mempool                            │
//! │  (Pending transactions: FIFO, dedup, requeue, TTL)      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ChainValidator                         │
//! │  (Spends, locks, ownership, membership, evidence)       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ChainState                           │
//! │  (Tip, accept/commit blocks, listeners)                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConsensusPool                          │
//! │  (Registered producers, slot order, key consistency)    │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod consensus_pool;
mod mempool;
mod state;
mod validator;

pub use consensus_pool::ConsensusPool;
pub use mempool::{Mempool, MempoolConfig, MempoolEntry, MempoolStats};
pub use state::{ApplyResult, BlockChangedListener, ChainError, ChainState};
pub use validator::{ChainValidator, TransactionValidator, TxRejection};
