//! Storage layer for rota.
//!
//! The consensus engine talks to persistence only through [`ChainStore`]:
//! - Blocks and the chain tip
//! - Confirmed transactions
//! - Raw chain-state flags (spent outputs, filed evidence, accounts)
//! - Registered consensus accounts
//!
//! Writes go through [`StorageBatch`], so a block and every state change it
//! implies land together:
//!
//! ```ignore
//! use rota_storage::{ChainStore, MemoryStore};
//!
//! let store = MemoryStore::with_genesis(&genesis)?;
//! store.save_block(&block)?; // one atomic batch
//! assert!(store.is_spent(&outpoint)?);
//! ```

mod batch;
mod memory;
mod traits;

pub use batch::{BatchOp, BatchWriter, StorageBatch};
pub use memory::MemoryStore;
pub use traits::{keys, BlockStore, ChainStore, StateStore, TxRecord};
