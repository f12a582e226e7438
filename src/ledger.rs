// Sharded ledger facade: admission, mining, block intake, exchange and carbon
//
// SAFETY INVARIANTS:
// 1. Every admitted user transaction is validated, signature-checked and
//    deduplicated before it touches a shard or the coordinator
// 2. A same-shard transaction reserves the sender's funds at admission, so a
//    later block can never overdraw it
// 3. Mining never holds a shard lock; a drained candidate is either appended
//    or requeued, never dropped
// 4. Blocks received from peers are fully verified before append; a peer
//    reward must pay for a block already on this node's chain

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::snapshot::{LedgerSnapshot, ShardSnapshot};
use dashmap::DashSet;
use log::{debug, error, info, warn};
use qfc_consensus::{
    reward_origin, CarbonCreditLedger, CarbonCreditMarket, ConsensusEngine, ConsensusError,
    EnergySource, MarketQuote,
};
use qfc_core::{
    Amount, Block, Ed25519Verifier, ShardId, SignatureVerifier, Transaction, TxHash,
    ValidationError, NETWORK_SENDER,
};
use qfc_exchange::{BookSnapshot, ExchangeEngine, Order, OrderRequest, Trade};
use qfc_state::{
    AssetLedger, CoordinatorError, CrossShardCoordinator, LedgerStateError, Shard, ShardRouter,
    TransferState, ESCROW_ACCOUNT,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where an admitted transaction went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Queued on the shard both endpoints live on.
    Queued { id: TxHash, shard: ShardId },
    /// Driven through two-phase commit.
    CrossShard { id: TxHash, state: TransferState },
}

impl SubmitOutcome {
    pub fn id(&self) -> TxHash {
        match self {
            SubmitOutcome::Queued { id, .. } | SubmitOutcome::CrossShard { id, .. } => *id,
        }
    }
}

pub struct ShardedLedger {
    pub(crate) config: LedgerConfig,
    pub(crate) router: ShardRouter,
    pub(crate) ledger: Arc<AssetLedger>,
    pub(crate) shards: Vec<Arc<Shard>>,
    engines: Vec<ConsensusEngine>,
    pub(crate) coordinator: CrossShardCoordinator,
    exchange: ExchangeEngine,
    carbon: Arc<CarbonCreditLedger>,
    carbon_market: CarbonCreditMarket,
    verifier: Arc<dyn SignatureVerifier>,
    // Every hash ever admitted or appended. Never pruned.
    pub(crate) seen: DashSet<TxHash>,
}

impl ShardedLedger {
    /// Build a ledger with the Ed25519 signature predicate.
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        Self::with_verifier(config, Arc::new(Ed25519Verifier))
    }

    pub fn with_verifier(
        config: LedgerConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let router = ShardRouter::new(config.num_shards)?;
        let ledger = Arc::new(AssetLedger::new());
        let carbon = Arc::new(CarbonCreditLedger::new());

        let shards: Vec<Arc<Shard>> = router
            .shards()
            .map(|id| Arc::new(Shard::new(id, Arc::clone(&ledger))))
            .collect();
        let engines = router
            .shards()
            .map(|id| ConsensusEngine::new(id, config.consensus.clone(), Arc::clone(&carbon)))
            .collect();
        let coordinator = CrossShardCoordinator::new(
            Arc::clone(&ledger),
            shards.clone(),
            router,
            config.retry.clone(),
        );
        let carbon_market = CarbonCreditMarket::new(Arc::clone(&carbon), config.carbon_credit_price);
        let exchange = ExchangeEngine::new(config.quote_asset.clone());

        info!(
            "Ledger ready: {} shards, difficulty {}, quote asset {}",
            config.num_shards, config.consensus.initial_difficulty, config.quote_asset
        );

        Ok(ShardedLedger {
            config,
            router,
            ledger,
            shards,
            engines,
            coordinator,
            exchange,
            carbon,
            carbon_market,
            verifier,
            seen: DashSet::new(),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn shard_of(&self, account: &str) -> ShardId {
        self.router.route(account)
    }

    pub(crate) fn shard(&self, id: ShardId) -> Result<&Arc<Shard>, LedgerError> {
        self.router.check(id)?;
        self.shards
            .get(id.index())
            .ok_or_else(|| qfc_state::RoutingError::ShardOutOfRange {
                shard: id,
                num_shards: self.router.num_shards(),
            }
            .into())
    }

    fn engine(&self, id: ShardId) -> Result<&ConsensusEngine, LedgerError> {
        self.router.check(id)?;
        self.engines
            .get(id.index())
            .ok_or_else(|| qfc_state::RoutingError::ShardOutOfRange {
                shard: id,
                num_shards: self.router.num_shards(),
            }
            .into())
    }

    // === Admission ===

    pub(crate) fn reject_reserved(account: &str) -> Result<(), ValidationError> {
        if account == NETWORK_SENDER || account == ESCROW_ACCOUNT {
            return Err(ValidationError::ReservedAccount(account.to_string()));
        }
        Ok(())
    }

    fn check_signature(&self, tx: &Transaction) -> Result<(), ValidationError> {
        match tx.signature() {
            Some(sig) if self.verifier.verify(&sig.signature, tx, &sig.public_key) => Ok(()),
            Some(_) => Err(ValidationError::InvalidSignature(tx.hash().as_hex())),
            None if self.config.require_signatures => Err(ValidationError::MissingSignature),
            None => Ok(()),
        }
    }

    /// Admit a user transaction.
    ///
    /// Same-shard transfers reserve the sender's funds and wait in the shard's
    /// pending queue. Cross-shard transfers run two-phase commit immediately.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<SubmitOutcome, LedgerError> {
        tx.validate()?;
        Self::reject_reserved(tx.sender())?;
        Self::reject_reserved(tx.recipient())?;
        self.check_signature(&tx)?;

        let id = tx.hash();
        if !self.seen.insert(id) {
            return Err(ValidationError::DuplicateTransaction(id.as_hex()).into());
        }

        let (source, destination) = self.router.endpoints(&tx);
        if source != destination {
            return match self.coordinator.execute(tx) {
                Ok(state) => Ok(SubmitOutcome::CrossShard { id, state }),
                Err(err) => {
                    if self.coordinator.outcome(&id).is_none() {
                        self.seen.remove(&id);
                    }
                    Err(err.into())
                }
            };
        }

        if let Err(err) = self
            .ledger
            .reserve(id, tx.sender(), tx.asset(), tx.amount())
        {
            self.seen.remove(&id);
            return Err(err.into());
        }
        self.shard(source)?.submit(tx);
        debug!("Admitted {} on {}", id.short(), source);
        Ok(SubmitOutcome::Queued { id, shard: source })
    }

    /// Unconditional issuance (on-ramp purchases, genesis allocations).
    pub fn credit(&self, account: &str, asset: &str, amount: Amount) -> Result<(), LedgerError> {
        Self::reject_reserved(account)?;
        self.ledger.credit(account, asset, amount)?;
        Ok(())
    }

    // === Blocks ===

    /// Verify and append a block produced elsewhere.
    pub fn receive_block(&self, shard_id: ShardId, block: Block) -> Result<(), LedgerError> {
        let shard = self.shard(shard_id)?;
        if block.shard_id != shard_id {
            return Err(LedgerStateError::WrongShard {
                expected: shard_id,
                got: block.shard_id,
            }
            .into());
        }

        let engine = self.engine(shard_id)?;
        engine.verify_block(&block)?;
        engine.validate_issuance(&block)?;
        for tx in &block.transactions {
            if tx.is_issuance() {
                self.check_reward_origin(tx)?;
            } else {
                self.check_signature(tx)?;
            }
        }

        shard.append(&block)?;
        for tx in &block.transactions {
            self.seen.insert(tx.hash());
        }
        info!("[{}] Accepted peer block #{}", shard_id, block.index);
        Ok(())
    }

    fn check_reward_origin(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let (source, index) = reward_origin(tx);
        let mined = match self.shard(source) {
            Ok(shard) => index < shard.chain_len() as u64,
            Err(_) => false,
        };
        if !mined {
            warn!("Peer reward {} names unknown block {} #{}", tx.hash().short(), source, index);
            return Err(ConsensusError::InvalidIssuance {
                reason: format!("reward for {} block #{} which is not on chain", source, index),
            }
            .into());
        }
        Ok(())
    }

    pub fn latest_block(&self, shard_id: ShardId) -> Result<Block, LedgerError> {
        Ok(self.shard(shard_id)?.latest_block())
    }

    pub fn chain(&self, shard_id: ShardId) -> Result<Vec<Block>, LedgerError> {
        Ok(self.shard(shard_id)?.chain())
    }

    pub fn blocks_from(&self, shard_id: ShardId, from_index: u64) -> Result<Vec<Block>, LedgerError> {
        Ok(self.shard(shard_id)?.blocks_from(from_index))
    }

    pub fn pending(&self, shard_id: ShardId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.shard(shard_id)?.pending())
    }

    pub fn difficulty(&self, shard_id: ShardId) -> Result<u32, LedgerError> {
        Ok(self.engine(shard_id)?.difficulty())
    }

    // === Mining ===

    /// Drain, mine and append one block on `shard_id`.
    ///
    /// Returns `None` when nothing is pending. A fork conflict requeues the
    /// drained transactions and re-seals on the new tip, up to
    /// `max_fork_retries` times.
    pub fn mine_shard(&self, shard_id: ShardId, miner: &str) -> Result<Option<Block>, LedgerError> {
        Self::reject_reserved(miner)?;
        let shard = self.shard(shard_id)?;
        let engine = self.engine(shard_id)?;

        let mut attempts = 0;
        let block = loop {
            attempts += 1;
            let Some(candidate) = shard.seal_candidate(miner) else {
                return Ok(None);
            };

            let seal = match engine.mine(&candidate, miner) {
                Ok(seal) => seal,
                Err(err) => {
                    shard.requeue(candidate.transactions);
                    return Err(err.into());
                }
            };
            let block = seal.apply(candidate);

            if let Err(err) = engine.verify_block(&block) {
                error!("[{}] Own block #{} failed verification: {}", shard_id, block.index, err);
                shard.requeue(block.transactions);
                return Err(err.into());
            }

            match shard.append(&block) {
                Ok(()) => break block,
                Err(LedgerStateError::ForkConflict { .. }) => {
                    shard.requeue(block.transactions);
                    if attempts >= self.config.max_fork_retries {
                        error!("[{}] Gave up re-sealing after {} fork conflicts", shard_id, attempts);
                        return Err(LedgerError::ForkRetriesExhausted {
                            shard: shard_id,
                            attempts,
                        });
                    }
                    warn!("[{}] Re-sealing after fork conflict (attempt {})", shard_id, attempts);
                }
                Err(err) => {
                    // The block cannot apply as a whole: drop it and free its holds.
                    for tx in &block.transactions {
                        if let Err(release_err) = self.ledger.release(&tx.hash()) {
                            warn!("Could not release {}: {}", tx.hash().short(), release_err);
                        }
                    }
                    error!("[{}] Discarded block #{}: {}", shard_id, block.index, err);
                    return Err(err.into());
                }
            }
        };

        for tx in &block.transactions {
            self.seen.insert(tx.hash());
        }
        self.reward_miner(engine, &block, miner)?;
        Ok(Some(block))
    }

    fn reward_miner(&self, engine: &ConsensusEngine, block: &Block, miner: &str) -> Result<(), LedgerError> {
        let reward = engine.reward_transaction(miner, block.index)?;
        let destination = self.router.route(miner);
        self.seen.insert(reward.hash());
        self.shard(destination)?.submit(reward);

        if let Some(source) = block
            .energy_source
            .as_deref()
            .and_then(|label| label.parse::<EnergySource>().ok())
        {
            engine.award_carbon(miner, source)?;
        }
        Ok(())
    }

    /// Mine every shard in parallel. Results are ordered by shard id.
    pub fn mine_all(&self, miner: &str) -> Vec<(ShardId, Result<Option<Block>, LedgerError>)> {
        self.shards
            .par_iter()
            .map(|shard| (shard.id(), self.mine_shard(shard.id(), miner)))
            .collect()
    }

    // === Exchange ===

    pub fn place_order(&self, request: OrderRequest) -> Result<Order, LedgerError> {
        Self::reject_reserved(&request.user)?;
        Ok(self.exchange.place_order(request)?)
    }

    pub fn cancel_order(&self, asset: &str, seq: u64) -> Result<Order, LedgerError> {
        Ok(self.exchange.cancel_order(asset, seq)?)
    }

    /// Match `asset`'s book, settling every fill through the ledger.
    pub fn match_orders(&self, asset: &str) -> Result<Vec<Trade>, LedgerError> {
        Ok(self.exchange.match_orders(asset, self)?)
    }

    pub fn order_book(&self, asset: &str) -> BookSnapshot {
        self.exchange.book(asset)
    }

    pub fn best_bid(&self, asset: &str) -> Option<Order> {
        self.exchange.best_bid(asset)
    }

    pub fn best_ask(&self, asset: &str) -> Option<Order> {
        self.exchange.best_ask(asset)
    }

    // === Carbon credits ===

    pub fn carbon_balance(&self, account: &str) -> Amount {
        self.carbon.balance(account)
    }

    pub fn transfer_carbon_credits(&self, from: &str, to: &str, amount: Amount) -> Result<(), LedgerError> {
        Ok(self.carbon.transfer(from, to, amount)?)
    }

    pub fn sell_carbon_credits(&self, seller: &str, amount: Amount) -> Result<Amount, LedgerError> {
        Ok(self.carbon_market.sell_credits(seller, amount)?)
    }

    pub fn buy_carbon_credits(&self, buyer: &str, amount: Amount) -> Result<Amount, LedgerError> {
        Ok(self.carbon_market.buy_credits(buyer, amount)?)
    }

    pub fn adjust_carbon_price(&self) -> Amount {
        self.carbon_market.adjust_price()
    }

    pub fn carbon_quote(&self) -> MarketQuote {
        self.carbon_market.quote()
    }

    // === Cross-shard recovery ===

    /// Retry every transfer parked in escrow.
    pub fn retry_cross_shard(&self) -> Vec<(TxHash, Result<TransferState, CoordinatorError>)> {
        self.coordinator.retry_pending()
    }

    /// Refund an escrowed transfer's sender and abort it.
    pub fn compensate_transfer(&self, id: &TxHash) -> Result<TransferState, LedgerError> {
        Ok(self.coordinator.compensate(id)?)
    }

    pub fn transfer_state(&self, id: &TxHash) -> Option<TransferState> {
        self.coordinator.outcome(id)
    }

    pub fn set_shard_reachable(&self, shard_id: ShardId, reachable: bool) -> Result<(), LedgerError> {
        self.shard(shard_id)?.set_reachable(reachable);
        Ok(())
    }

    // === Queries ===

    pub fn balance(&self, account: &str, asset: &str) -> Amount {
        self.ledger.balance(account, asset)
    }

    pub fn available(&self, account: &str, asset: &str) -> Amount {
        self.ledger.available(account, asset)
    }

    pub fn total_supply(&self, asset: &str) -> Amount {
        self.ledger.total_supply(asset)
    }

    /// Logical state: chains, queues, retarget windows, balances, credits, books.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let shards = self
            .shards
            .iter()
            .zip(&self.engines)
            .map(|(shard, engine)| ShardSnapshot {
                shard_id: shard.id(),
                chain: shard.chain(),
                pending: shard.pending(),
                difficulty: engine.difficulty_snapshot(),
            })
            .collect();

        LedgerSnapshot {
            shards,
            balances: self.ledger.snapshot(),
            carbon_credits: self.carbon.snapshot(),
            carbon_market: self.carbon_market.quote(),
            order_books: self.exchange.books(),
            in_flight: self.coordinator.in_flight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfc_core::{units, DEFAULT_ASSET};

    fn ledger() -> ShardedLedger {
        let mut config = LedgerConfig::default();
        config.consensus.initial_difficulty = 1;
        config.retry = qfc_state::RetryPolicy::immediate(2);
        ShardedLedger::new(config).unwrap()
    }

    fn pair_on(ledger: &ShardedLedger, a: u32, b: u32) -> (String, String) {
        let router = ledger.router();
        (
            router.account_on("alice", ShardId(a)).unwrap(),
            router.account_on("bob", ShardId(b)).unwrap(),
        )
    }

    #[test]
    fn test_same_shard_transfer_reserves_then_applies() {
        let ledger = ledger();
        let (alice, bob) = pair_on(&ledger, 0, 0);
        ledger.credit(&alice, DEFAULT_ASSET, units(10)).unwrap();

        let tx = Transaction::new(&alice, &bob, units(4), DEFAULT_ASSET).unwrap();
        let outcome = ledger.submit_transaction(tx).unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { shard: ShardId(0), .. }));
        assert_eq!(ledger.available(&alice, DEFAULT_ASSET), units(6));
        assert_eq!(ledger.balance(&bob, DEFAULT_ASSET), 0);

        let block = ledger.mine_shard(ShardId(0), "miner").unwrap().unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(ledger.balance(&alice, DEFAULT_ASSET), units(6));
        assert_eq!(ledger.balance(&bob, DEFAULT_ASSET), units(4));
    }

    #[test]
    fn test_overdraft_rejected_at_admission() {
        let ledger = ledger();
        let (alice, bob) = pair_on(&ledger, 1, 1);
        ledger.credit(&alice, DEFAULT_ASSET, units(3)).unwrap();

        let first = Transaction::new(&alice, &bob, units(2), DEFAULT_ASSET).unwrap();
        let second = Transaction::new(&alice, &bob, units(2), DEFAULT_ASSET)
            .unwrap()
            .with_nonce(1);
        ledger.submit_transaction(first).unwrap();
        let err = ledger.submit_transaction(second).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(ledger.pending(ShardId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_submission_rejected() {
        let ledger = ledger();
        let (alice, bob) = pair_on(&ledger, 2, 2);
        ledger.credit(&alice, DEFAULT_ASSET, units(10)).unwrap();
        let tx = Transaction::new(&alice, &bob, units(1), DEFAULT_ASSET).unwrap();
        ledger.submit_transaction(tx.clone()).unwrap();
        assert!(matches!(
            ledger.submit_transaction(tx),
            Err(LedgerError::Validation(ValidationError::DuplicateTransaction(_)))
        ));
    }

    #[test]
    fn test_reserved_accounts_rejected() {
        let ledger = ledger();
        let forged = Transaction::issuance("mallory", units(5), DEFAULT_ASSET, 0).unwrap();
        assert!(matches!(
            ledger.submit_transaction(forged),
            Err(LedgerError::Validation(ValidationError::ReservedAccount(_)))
        ));
        assert!(ledger.credit(ESCROW_ACCOUNT, DEFAULT_ASSET, 1).is_err());
    }

    #[test]
    fn test_mining_rewards_miner_and_awards_carbon() {
        let ledger = ledger();
        let (alice, bob) = pair_on(&ledger, 0, 0);
        ledger.credit(&alice, DEFAULT_ASSET, units(1)).unwrap();
        ledger
            .submit_transaction(Transaction::new(&alice, &bob, units(1), DEFAULT_ASSET).unwrap())
            .unwrap();

        ledger.mine_shard(ShardId(0), "miner").unwrap().unwrap();
        let miner_shard = ledger.shard_of("miner");
        assert_eq!(ledger.pending(miner_shard).unwrap().len(), 1);
        assert!(ledger.carbon_balance("miner") >= units(1));

        ledger.mine_shard(miner_shard, "miner").unwrap().unwrap();
        assert_eq!(ledger.balance("miner", DEFAULT_ASSET), units(50));
    }

    #[test]
    fn test_empty_shard_mines_nothing() {
        let ledger = ledger();
        assert_eq!(ledger.mine_shard(ShardId(1), "miner").unwrap(), None);
        assert_eq!(ledger.chain(ShardId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_shard_is_routing_error() {
        let ledger = ledger();
        assert!(matches!(ledger.latest_block(ShardId(7)), Err(LedgerError::Routing(_))));
    }

    #[test]
    fn test_peer_block_applies_and_clears_pending() {
        let producer = ledger();
        let follower = ledger();
        let (alice, bob) = pair_on(&producer, 0, 0);
        for node in [&producer, &follower] {
            node.credit(&alice, DEFAULT_ASSET, units(5)).unwrap();
        }

        let tx = Transaction::new(&alice, &bob, units(2), DEFAULT_ASSET).unwrap();
        producer.submit_transaction(tx.clone()).unwrap();
        follower.submit_transaction(tx).unwrap();

        let block = producer.mine_shard(ShardId(0), "miner").unwrap().unwrap();
        follower.receive_block(ShardId(0), block.clone()).unwrap();

        assert_eq!(follower.latest_block(ShardId(0)).unwrap(), block);
        assert!(follower.pending(ShardId(0)).unwrap().is_empty());
        assert_eq!(follower.balance(&bob, DEFAULT_ASSET), units(2));
        assert_eq!(follower.available(&alice, DEFAULT_ASSET), units(3));
    }

    #[test]
    fn test_tampered_peer_block_rejected() {
        let producer = ledger();
        let follower = ledger();
        let (alice, bob) = pair_on(&producer, 0, 0);
        producer.credit(&alice, DEFAULT_ASSET, units(5)).unwrap();
        producer
            .submit_transaction(Transaction::new(&alice, &bob, units(2), DEFAULT_ASSET).unwrap())
            .unwrap();

        let mut block = producer.mine_shard(ShardId(0), "miner").unwrap().unwrap();
        block.nonce = block.nonce.wrapping_add(1);
        assert!(matches!(
            follower.receive_block(ShardId(0), block),
            Err(LedgerError::Consensus(_))
        ));
        assert_eq!(follower.chain(ShardId(0)).unwrap().len(), 1);
    }
}
