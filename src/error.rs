use crate::config::ConfigError;
use qfc_consensus::{CarbonError, ConsensusError};
use qfc_core::{ShardId, ValidationError};
use qfc_exchange::ExchangeError;
use qfc_state::{CoordinatorError, LedgerStateError, RoutingError};
use thiserror::Error;

/// Every failure the ledger facade can report.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] LedgerStateError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Carbon(#[from] CarbonError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{shard} kept losing fork races after {attempts} attempts")]
    ForkRetriesExhausted { shard: ShardId, attempts: u32 },

    #[error("unsupported fiat currency {0}")]
    UnsupportedCurrency(String),

    #[error("payment for {user} declined: {reason}")]
    PaymentDeclined { user: String, reason: String },
}

impl LedgerError {
    /// Rejections that say the input was bad, as opposed to the ledger failing.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::Validation(_)
                | LedgerError::State(LedgerStateError::Validation(_))
                | LedgerError::Coordinator(CoordinatorError::State(LedgerStateError::Validation(_)))
                | LedgerError::Exchange(ExchangeError::Validation(_))
                | LedgerError::Consensus(ConsensusError::Validation(_))
        )
    }
}
