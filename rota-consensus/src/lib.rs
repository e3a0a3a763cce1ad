//! Rota Consensus - Slot scheduling and block production.
//!
//! Registered consensus accounts take turns producing blocks. Each round gives
//! every pool member one slot of `time_period`, in registration order:
//!
//! ```text
//!   round start                                         next round
//!   |  slot 0 (A)  |  slot 1 (B)  |  slot 2 (C)  |  slot 0 (A) ...
//!   |<--- tp --->|
//!
//!   ConsensusMeeting ── poll_slot ──► MiningService ── commit ──► ChainState
//!         ▲                               │   ▲                        │
//!         │ meeting messages               │   └── get_timeout_list     │
//!     NetworkHandle ◄──── announce_block ──┘                            │
//!         ▲                                                             │
//!         └──────────────── BlockChangedListener ◄──────────────────────┘
//! ```
//!
//! - [`meeting`] - Round and slot computation, peer state exchange, timeouts
//! - [`mining`] - Mempool drain, penalties, coinbase, seal and commit
//! - [`violation`] - Deduplicated penalty filing
//! - [`message`] - Signed meeting messages
//! - [`traits`] - Network and account collaborators
//! - `mock` - In-process collaborators for tests (`test-util` feature)

pub mod meeting;
pub mod message;
pub mod mining;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod traits;
pub mod violation;

pub use meeting::{
    ConsensusMeeting, MeetingConfig, MeetingError, MeetingStatus, MiningSlot, TimeoutViolation,
};
pub use message::{MeetingKind, MeetingMessage};
pub use mining::{MiningConfig, MiningError, MiningService, MiningState, MiningStats};
pub use traits::{AccountProvider, CreditPolicy, MiningAccount, NetworkHandle, NoCredit};
pub use violation::ViolationFiler;
