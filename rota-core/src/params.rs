//! Chain parameters shared by every node of a network.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Consensus-critical constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub chain_id: String,
    /// Length of one producer slot.
    #[serde(with = "duration_millis")]
    pub time_period: Duration,
    /// Budget for draining the mempool inside a slot.
    #[serde(with = "duration_millis")]
    pub block_gen_time: Duration,
    /// Blocks a coinbase output stays locked.
    pub mining_mature_count: u64,
    /// Reward at height 1, in base units.
    pub initial_reward: i64,
    /// Blocks between reward halvings.
    pub halving_interval: u64,
    /// Genesis timestamp, unix millis. Rounds are anchored here.
    pub genesis_time: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_id: "rota-local".to_string(),
            time_period: Duration::from_secs(10),
            block_gen_time: Duration::from_secs(6),
            mining_mature_count: 10,
            initial_reward: 50 * 100_000_000,
            halving_interval: 2_100_000,
            genesis_time: 0,
        }
    }
}

impl ChainParams {
    /// Slot length in millis.
    pub fn time_period_millis(&self) -> i64 {
        self.time_period.as_millis() as i64
    }

    pub fn block_gen_millis(&self) -> i64 {
        self.block_gen_time.as_millis() as i64
    }

    /// Reward for producing the block at `height`.
    pub fn block_reward(&self, height: u64) -> i64 {
        if self.halving_interval == 0 {
            return self.initial_reward;
        }
        let halvings = height / self.halving_interval;
        if halvings >= 63 {
            0
        } else {
            self.initial_reward >> halvings
        }
    }

    /// Lock time of the coinbase produced at `height`.
    pub fn coinbase_lock_time(&self, height: u64) -> u64 {
        height + self.mining_mature_count
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
