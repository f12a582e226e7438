use qfc_consensus::{DifficultySnapshot, MarketQuote};
use qfc_core::{Amount, Block, ShardId, Transaction};
use qfc_exchange::BookSnapshot;
use qfc_state::{BalanceSnapshot, CrossShardTransfer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard_id: ShardId,
    pub chain: Vec<Block>,
    pub pending: Vec<Transaction>,
    pub difficulty: DifficultySnapshot,
}

/// Serializable logical state of a whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub shards: Vec<ShardSnapshot>,
    pub balances: BalanceSnapshot,
    pub carbon_credits: BTreeMap<String, Amount>,
    pub carbon_market: MarketQuote,
    pub order_books: BTreeMap<String, BookSnapshot>,
    pub in_flight: Vec<CrossShardTransfer>,
}

impl LedgerSnapshot {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn pending_total(&self) -> usize {
        self.shards.iter().map(|s| s.pending.len()).sum()
    }
}
