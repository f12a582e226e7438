// === Balances ===
pub mod asset_ledger;
pub mod cross_shard_locking;

// === Shards ===
pub mod shard;
pub mod sharding;

// === Cross-shard transfers ===
pub mod cross_shard_2pc;
pub mod cross_shard_recovery;

pub mod error;

pub use asset_ledger::{AssetLedger, BalanceSnapshot, ESCROW_ACCOUNT};
pub use cross_shard_2pc::{CrossShardCoordinator, CrossShardTransfer, TransferState};
pub use cross_shard_locking::{Balance, BalanceKey};
pub use cross_shard_recovery::{Backoff, RetryPolicy};
pub use error::{CoordinatorError, LedgerStateError, RoutingError};
pub use shard::Shard;
pub use sharding::ShardRouter;
