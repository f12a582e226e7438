use qfc_consensus::ConsensusConfig;
use qfc_core::{units, Amount};
use qfc_state::{RetryPolicy, RoutingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ledger-wide settings. Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Asset every order book is priced in.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Reject unsigned transactions at admission.
    #[serde(default)]
    pub require_signatures: bool,
    /// Initial carbon credit price, in QFC base units.
    #[serde(default = "default_carbon_credit_price")]
    pub carbon_credit_price: Amount,
    /// Re-seal attempts after a fork conflict before giving up.
    #[serde(default = "default_max_fork_retries")]
    pub max_fork_retries: u32,
}

fn default_num_shards() -> u32 {
    3
}

fn default_quote_asset() -> String {
    "USD".to_string()
}

fn default_carbon_credit_price() -> Amount {
    units(10)
}

fn default_max_fork_retries() -> u32 {
    3
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            num_shards: default_num_shards(),
            consensus: ConsensusConfig::default(),
            retry: RetryPolicy::default(),
            quote_asset: default_quote_asset(),
            require_signatures: false,
            carbon_credit_price: default_carbon_credit_price(),
            max_fork_retries: default_max_fork_retries(),
        }
    }
}

impl LedgerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Fail fast on settings the ledger cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_shards == 0 {
            return Err(RoutingError::NoShards.into());
        }
        if self.consensus.adjustment_interval == 0 {
            return Err(ConfigError::Invalid("adjustment_interval must be positive".into()));
        }
        if self.consensus.target_block_time_ms == 0 {
            return Err(ConfigError::Invalid("target_block_time_ms must be positive".into()));
        }
        if self.consensus.reward_amount == 0 || self.consensus.reward_asset.is_empty() {
            return Err(ConfigError::Invalid("mining reward must be a positive amount of a named asset".into()));
        }
        if self.quote_asset.is_empty() {
            return Err(ConfigError::Invalid("quote_asset must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".into()));
        }
        if self.max_fork_retries == 0 {
            return Err(ConfigError::Invalid("max_fork_retries must be positive".into()));
        }
        Ok(())
    }
}
