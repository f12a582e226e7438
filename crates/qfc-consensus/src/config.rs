use qfc_core::{units, Amount, DEFAULT_ASSET};
use serde::{Deserialize, Serialize};

/// Mining parameters shared by every shard's engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Leading '0' hex characters required at startup.
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: u32,
    #[serde(default = "default_target_block_time_ms")]
    pub target_block_time_ms: u64,
    /// Samples per retarget window.
    #[serde(default = "default_adjustment_interval")]
    pub adjustment_interval: usize,
    /// Nonce search bound; `None` searches until found.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_reward_amount")]
    pub reward_amount: Amount,
    #[serde(default = "default_reward_asset")]
    pub reward_asset: String,
}

fn default_initial_difficulty() -> u32 {
    4
}

fn default_target_block_time_ms() -> u64 {
    60_000
}

fn default_adjustment_interval() -> usize {
    10
}

fn default_reward_amount() -> Amount {
    units(50)
}

fn default_reward_asset() -> String {
    DEFAULT_ASSET.to_string()
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            initial_difficulty: default_initial_difficulty(),
            target_block_time_ms: default_target_block_time_ms(),
            adjustment_interval: default_adjustment_interval(),
            max_iterations: None,
            reward_amount: default_reward_amount(),
            reward_asset: default_reward_asset(),
        }
    }
}
