// Shard: one append-only chain plus one pending queue
//
// SAFETY INVARIANTS:
// 1. A single mutex guards chain and queue (single writer per shard)
// 2. Appends extend the tip exactly: index == len, previous_hash == tip.hash
// 3. Ledger effects are applied before the block becomes visible
// 4. No transaction is included twice

use crate::asset_ledger::AssetLedger;
use crate::error::LedgerStateError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use qfc_core::{Block, ShardId, Transaction, TxHash, ValidationError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ShardState {
    chain: Vec<Block>,
    pending: VecDeque<Transaction>,
    // Every hash on chain. Never pruned.
    included: HashSet<TxHash>,
}

pub struct Shard {
    id: ShardId,
    ledger: Arc<AssetLedger>,
    state: Mutex<ShardState>,
    reachable: AtomicBool,
}

impl Shard {
    pub fn new(id: ShardId, ledger: Arc<AssetLedger>) -> Self {
        Shard {
            id,
            ledger,
            state: Mutex::new(ShardState {
                chain: vec![Block::genesis(id)],
                pending: VecDeque::new(),
                included: HashSet::new(),
            }),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Queue a transaction for the next block. Balances are not checked here.
    pub fn submit(&self, tx: Transaction) {
        let mut state = self.state.lock();
        debug!("[{}] Queued transaction {}", self.id, tx.hash().short());
        state.pending.push_back(tx);
    }

    /// Drain the whole pending queue into an unmined block on top of the tip.
    pub fn seal_candidate(&self, miner: &str) -> Option<Block> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return None;
        }
        let transactions: Vec<Transaction> = state.pending.drain(..).collect();
        let (index, previous_hash) = match state.chain.last() {
            Some(tip) => (tip.index + 1, tip.hash.clone()),
            None => return None,
        };
        debug!(
            "[{}] Sealed candidate #{} with {} transactions for {}",
            self.id,
            index,
            transactions.len(),
            miner
        );
        Some(Block::candidate(self.id, index, transactions, previous_hash))
    }

    /// Put transactions back at the head of the queue, skipping any already on chain.
    pub fn requeue(&self, transactions: Vec<Transaction>) {
        let mut state = self.state.lock();
        let mut restored = 0;
        for tx in transactions.into_iter().rev() {
            if state.included.contains(&tx.hash()) {
                continue;
            }
            state.pending.push_front(tx);
            restored += 1;
        }
        if restored > 0 {
            info!("[{}] Requeued {} transactions", self.id, restored);
        }
    }

    /// Extend the chain with a sealed block after applying its balance effects.
    pub fn append(&self, block: &Block) -> Result<(), LedgerStateError> {
        let mut state = self.state.lock();

        if block.shard_id != self.id {
            return Err(LedgerStateError::WrongShard {
                expected: self.id,
                got: block.shard_id,
            });
        }

        let (tip_len, tip_hash) = match state.chain.last() {
            Some(tip) => (state.chain.len() as u64, tip.hash.clone()),
            None => (0, String::new()),
        };
        if block.index != tip_len || block.previous_hash != tip_hash {
            warn!(
                "[{}] Fork conflict: block #{} does not extend #{}",
                self.id,
                block.index,
                tip_len.saturating_sub(1)
            );
            return Err(LedgerStateError::ForkConflict {
                shard: self.id,
                expected_index: tip_len,
                got_index: block.index,
                expected_previous: tip_hash,
                got_previous: block.previous_hash.clone(),
            });
        }

        let mut hashes: HashSet<TxHash> = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let id = tx.hash();
            if state.included.contains(&id) || !hashes.insert(id) {
                warn!(
                    "[{}] Block #{} repeats transaction {}",
                    self.id,
                    block.index,
                    id.short()
                );
                return Err(ValidationError::DuplicateTransaction(id.as_hex()).into());
            }
        }

        self.ledger.apply_transactions(&block.transactions)?;

        state.pending.retain(|tx| {
            !hashes.contains(&tx.hash()) && !(tx.is_issuance() && self.ledger.is_issued(tx.nonce()))
        });
        state.included.extend(hashes);
        state.chain.push(block.clone());

        info!(
            "[{}] Appended block #{} ({} txs) {}",
            self.id,
            block.index,
            block.transactions.len(),
            block.hash
        );
        Ok(())
    }

    pub fn latest_block(&self) -> Block {
        let state = self.state.lock();
        match state.chain.last() {
            Some(tip) => tip.clone(),
            None => Block::genesis(self.id),
        }
    }

    pub fn chain_len(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.state.lock().pending.iter().cloned().collect()
    }

    pub fn is_included(&self, id: &TxHash) -> bool {
        self.state.lock().included.contains(id)
    }

    /// Blocks at or after `index`, for peers catching up.
    pub fn blocks_from(&self, index: u64) -> Vec<Block> {
        let state = self.state.lock();
        state
            .chain
            .iter()
            .skip(index as usize)
            .cloned()
            .collect()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.state.lock().chain.clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if reachable {
            info!("[{}] Marked reachable", self.id);
        } else {
            warn!("[{}] Marked unreachable", self.id);
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfc_core::{units, DEFAULT_ASSET};

    fn shard_with(alice: u64) -> (Arc<AssetLedger>, Shard) {
        let ledger = Arc::new(AssetLedger::new());
        ledger.credit("alice", DEFAULT_ASSET, units(alice)).unwrap();
        let shard = Shard::new(ShardId(0), Arc::clone(&ledger));
        (ledger, shard)
    }

    fn pay(whole: u64, nonce: u64) -> Transaction {
        Transaction::with_timestamp("alice", "bob", units(whole), DEFAULT_ASSET, 1)
            .unwrap()
            .with_nonce(nonce)
    }

    #[test]
    fn test_new_shard_starts_at_genesis() {
        let (_, shard) = shard_with(0);
        assert_eq!(shard.chain_len(), 1);
        assert!(shard.latest_block().is_genesis());
        assert!(shard.seal_candidate("miner").is_none());
    }

    #[test]
    fn test_seal_drains_queue_onto_tip() {
        let (_, shard) = shard_with(10);
        shard.submit(pay(1, 1));
        shard.submit(pay(2, 2));
        let candidate = shard.seal_candidate("miner").unwrap();
        assert_eq!(candidate.index, 1);
        assert_eq!(candidate.previous_hash, shard.latest_block().hash);
        assert_eq!(candidate.transactions.len(), 2);
        assert_eq!(shard.pending_len(), 0);
    }

    #[test]
    fn test_append_applies_balances() {
        let (ledger, shard) = shard_with(10);
        shard.submit(pay(4, 1));
        let block = shard.seal_candidate("miner").unwrap();
        shard.append(&block).unwrap();
        assert_eq!(shard.chain_len(), 2);
        assert_eq!(ledger.balance("alice", DEFAULT_ASSET), units(6));
        assert_eq!(ledger.balance("bob", DEFAULT_ASSET), units(4));
    }

    #[test]
    fn test_stale_block_is_fork_conflict() {
        let (_, shard) = shard_with(10);
        shard.submit(pay(1, 1));
        let first = shard.seal_candidate("miner").unwrap();
        shard.submit(pay(1, 2));
        let stale = shard.seal_candidate("miner").unwrap();
        shard.append(&first).unwrap();
        assert!(matches!(
            shard.append(&stale),
            Err(LedgerStateError::ForkConflict { expected_index: 2, got_index: 1, .. })
        ));
    }

    #[test]
    fn test_wrong_shard_rejected() {
        let (ledger, shard) = shard_with(10);
        let other = Shard::new(ShardId(1), ledger);
        other.submit(pay(1, 1));
        let block = other.seal_candidate("miner").unwrap();
        assert!(matches!(shard.append(&block), Err(LedgerStateError::WrongShard { .. })));
    }

    #[test]
    fn test_failed_apply_leaves_chain_unchanged() {
        let (_, shard) = shard_with(1);
        shard.submit(pay(5, 1));
        let block = shard.seal_candidate("miner").unwrap();
        assert!(shard.append(&block).is_err());
        assert_eq!(shard.chain_len(), 1);
    }

    #[test]
    fn test_append_prunes_included_pending() {
        let (ledger, shard) = shard_with(10);
        let peer = Shard::new(ShardId(0), Arc::new(AssetLedger::new()));
        let tx = pay(1, 1);
        shard.submit(tx.clone());
        peer.submit(tx.clone());
        let block = peer.seal_candidate("peer").unwrap();

        shard.append(&block).unwrap();
        assert_eq!(shard.pending_len(), 0);
        assert_eq!(ledger.balance("bob", DEFAULT_ASSET), units(1));

        shard.requeue(vec![tx]);
        assert_eq!(shard.pending_len(), 0);
    }

    #[test]
    fn test_block_repeating_included_transaction_rejected() {
        let (ledger, shard) = shard_with(10);
        let tx = pay(2, 1);
        shard.submit(tx.clone());
        let first = shard.seal_candidate("miner").unwrap();
        shard.append(&first).unwrap();

        let replay = Block::candidate(ShardId(0), 2, vec![tx.clone()], first.hash.clone());
        assert_eq!(
            shard.append(&replay),
            Err(LedgerStateError::Validation(ValidationError::DuplicateTransaction(
                tx.hash().as_hex()
            )))
        );
        assert_eq!(shard.chain_len(), 2);
        assert_eq!(ledger.balance("bob", DEFAULT_ASSET), units(2));
    }

    #[test]
    fn test_block_with_repeated_transaction_rejected() {
        let (ledger, shard) = shard_with(10);
        let tx = pay(1, 1);
        let tip = shard.latest_block().hash;
        let block = Block::candidate(ShardId(0), 1, vec![tx.clone(), tx], tip);
        assert!(matches!(
            shard.append(&block),
            Err(LedgerStateError::Validation(ValidationError::DuplicateTransaction(_)))
        ));
        assert_eq!(shard.chain_len(), 1);
        assert_eq!(ledger.balance("alice", DEFAULT_ASSET), units(10));
    }

    #[test]
    fn test_append_drops_pending_reward_already_minted() {
        let (ledger, shard) = shard_with(0);
        let local = Transaction::issuance("miner", units(50), DEFAULT_ASSET, 7).unwrap();
        let peer = Transaction::issuance("other", units(50), DEFAULT_ASSET, 7).unwrap();
        shard.submit(local);

        let tip = shard.latest_block().hash;
        shard
            .append(&Block::candidate(ShardId(0), 1, vec![peer], tip))
            .unwrap();
        assert_eq!(shard.pending_len(), 0);
        assert_eq!(ledger.total_supply(DEFAULT_ASSET), units(50));
    }

    #[test]
    fn test_requeue_restores_order_at_head() {
        let (_, shard) = shard_with(10);
        shard.submit(pay(3, 3));
        let drained = vec![pay(1, 1), pay(2, 2)];
        shard.requeue(drained);
        let order: Vec<u64> = shard.pending().iter().map(|tx| tx.nonce()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_blocks_from_returns_suffix() {
        let (_, shard) = shard_with(10);
        shard.submit(pay(1, 1));
        let block = shard.seal_candidate("miner").unwrap();
        shard.append(&block).unwrap();
        assert_eq!(shard.blocks_from(0).len(), 2);
        assert_eq!(shard.blocks_from(1), vec![block]);
        assert!(shard.blocks_from(5).is_empty());
    }
}
