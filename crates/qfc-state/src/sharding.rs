use crate::error::RoutingError;
use qfc_core::{ShardId, Transaction};
use sha2::{Digest, Sha256};

/// Deterministic account -> shard assignment.
///
/// The first eight bytes of SHA-256(account), read big-endian, modulo the
/// shard count. Fixed for the ledger's lifetime: there is no rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    num_shards: u32,
}

impl ShardRouter {
    pub fn new(num_shards: u32) -> Result<Self, RoutingError> {
        if num_shards == 0 {
            return Err(RoutingError::NoShards);
        }
        Ok(ShardRouter { num_shards })
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn route(&self, account: &str) -> ShardId {
        let digest = Sha256::digest(account.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(prefix) % u64::from(self.num_shards);
        ShardId(bucket as u32)
    }

    pub fn check(&self, shard: ShardId) -> Result<(), RoutingError> {
        if shard.0 >= self.num_shards {
            return Err(RoutingError::ShardOutOfRange {
                shard,
                num_shards: self.num_shards,
            });
        }
        Ok(())
    }

    /// (source, destination) for a transaction.
    pub fn endpoints(&self, tx: &Transaction) -> (ShardId, ShardId) {
        (self.route(tx.sender()), self.route(tx.recipient()))
    }

    pub fn is_cross_shard(&self, tx: &Transaction) -> bool {
        let (source, destination) = self.endpoints(tx);
        source != destination
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.num_shards).map(ShardId)
    }

    /// Deterministic account name routed to `shard`: `"{prefix}-{n}"` for the smallest `n`.
    ///
    /// Used to pick fixture and operator accounts on a known shard.
    pub fn account_on(&self, prefix: &str, shard: ShardId) -> Result<String, RoutingError> {
        self.check(shard)?;
        let account = (0u64..)
            .map(|n| format!("{}-{}", prefix, n))
            .find(|candidate| self.route(candidate) == shard);
        // An unbounded search over uniformly spread hashes always finds one.
        account.ok_or(RoutingError::ShardOutOfRange {
            shard,
            num_shards: self.num_shards,
        })
    }
}
