use qfc_core::{ShardId, ValidationError};
use thiserror::Error;

use crate::cross_shard_2pc::TransferState;

/// Failures while mutating balances or shard chains.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerStateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "fork conflict on {shard}: block #{got_index} (prev {got_previous}) does not extend #{expected_index} (prev {expected_previous})"
    )]
    ForkConflict {
        shard: ShardId,
        expected_index: u64,
        got_index: u64,
        expected_previous: String,
        got_previous: String,
    },

    #[error("block for {got} delivered to {expected}")]
    WrongShard { expected: ShardId, got: ShardId },

    #[error("reservation {0} already exists")]
    DuplicateReservation(String),

    #[error("reservation {0} not found")]
    ReservationNotFound(String),

    #[error("issuance {0:#x} was already minted")]
    DuplicateIssuance(u64),
}

/// Routing misconfiguration. Fatal at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("ledger needs at least one shard")]
    NoShards,

    #[error("{shard} is outside the configured {num_shards} shards")]
    ShardOutOfRange { shard: ShardId, num_shards: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    State(#[from] LedgerStateError),

    #[error("transfer {0} is not tracked by the coordinator")]
    UnknownTransfer(String),

    #[error("transfer {0} does not cross shards")]
    NotCrossShard(String),

    #[error("transfer {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TransferState,
        to: TransferState,
    },

    /// Destination did not acknowledge; the transfer stays Prepared.
    #[error("{shard} unreachable while committing transfer {id}")]
    Timeout { id: String, shard: ShardId },

    #[error("transfer {id} still unsettled after {attempts} attempts")]
    RetriesExhausted { id: String, attempts: u32 },
}

impl From<ValidationError> for CoordinatorError {
    fn from(err: ValidationError) -> Self {
        CoordinatorError::State(LedgerStateError::Validation(err))
    }
}
