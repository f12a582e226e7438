// End-to-end scenarios against the ledger facade

use ed25519_dalek::SigningKey;
use qfc_consensus::{solve, ConsensusError, EnergySource};
use qfc_core::{
    sign_ed25519, units, Block, ShardId, Transaction, ValidationError, DEFAULT_ASSET,
};
use qfc_exchange::OrderRequest;
use qfc_state::{LedgerStateError, RetryPolicy, TransferState, ESCROW_ACCOUNT};
use quantumfuse::{
    InboundMessage, LedgerConfig, LedgerError, OutboundMessage, ShardedLedger, SubmitOutcome,
};

fn ledger_with(difficulty: u32) -> ShardedLedger {
    let mut config = LedgerConfig::default();
    config.num_shards = 3;
    config.consensus.initial_difficulty = difficulty;
    config.retry = RetryPolicy::immediate(3);
    ShardedLedger::new(config).unwrap()
}

fn account(ledger: &ShardedLedger, prefix: &str, shard: u32) -> String {
    ledger.router().account_on(prefix, ShardId(shard)).unwrap()
}

/// Seal `transactions` on top of `shard`'s tip the way a peer would.
fn peer_block(ledger: &ShardedLedger, shard: ShardId, transactions: Vec<Transaction>) -> Block {
    let tip = ledger.latest_block(shard).unwrap();
    let candidate = Block::candidate(shard, tip.index + 1, transactions, tip.hash);
    let difficulty = ledger.difficulty(shard).unwrap();
    let (nonce, hash) = solve(
        &candidate.header_material_at(difficulty),
        difficulty,
        EnergySource::Wind,
        None,
    )
    .unwrap();
    candidate.sealed(nonce, difficulty, EnergySource::Wind.label().to_string(), hash)
}

fn reward(ledger: &ShardedLedger, miner: &str, shard: ShardId, index: u64) -> Transaction {
    let consensus = &ledger.config().consensus;
    Transaction::issuance(
        miner,
        consensus.reward_amount,
        consensus.reward_asset.clone(),
        (u64::from(shard.0) << 48) | index,
    )
    .unwrap()
}

#[test]
fn test_cross_shard_transfer_scenario() {
    let ledger = ledger_with(2);
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 1);
    ledger.credit(&a, DEFAULT_ASSET, units(100)).unwrap();

    let tx = Transaction::new(&a, &b, units(40), DEFAULT_ASSET).unwrap();
    let outcome = ledger.submit_transaction(tx).unwrap();

    assert!(matches!(
        outcome,
        SubmitOutcome::CrossShard { state: TransferState::Committed, .. }
    ));
    assert_eq!(ledger.transfer_state(&outcome.id()), Some(TransferState::Committed));
    assert_eq!(ledger.balance(&a, DEFAULT_ASSET), units(60));
    assert_eq!(ledger.balance(&b, DEFAULT_ASSET), units(40));
    assert_eq!(ledger.snapshot().pending_total(), 0);
    assert_eq!(ledger.total_supply(DEFAULT_ASSET), units(100));
}

#[test]
fn test_insufficient_cross_shard_transfer_changes_nothing() {
    let ledger = ledger_with(1);
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 2);
    ledger.credit(&a, DEFAULT_ASSET, units(10)).unwrap();
    let before = ledger.snapshot();

    let tx = Transaction::new(&a, &b, units(40), DEFAULT_ASSET).unwrap();
    let err = ledger.submit_transaction(tx).unwrap_err();

    assert!(err.is_validation());
    assert_eq!(ledger.snapshot(), before);
}

#[test]
fn test_order_settlement_scenario() {
    let ledger = ledger_with(1);
    let seller = account(&ledger, "seller", 0);
    let buyer = account(&ledger, "buyer", 0);
    ledger.credit(&seller, DEFAULT_ASSET, units(5)).unwrap();
    ledger.credit(&buyer, "USD", units(50)).unwrap();

    let sell = ledger
        .place_order(OrderRequest::sell(&seller, DEFAULT_ASSET, 5, units(10)))
        .unwrap();
    let buy = ledger
        .place_order(OrderRequest::buy(&buyer, DEFAULT_ASSET, 5, units(10)))
        .unwrap();
    assert!(sell.seq < buy.seq);

    let trades = ledger.match_orders(DEFAULT_ASSET).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, units(10));
    assert_eq!(trades[0].quantity, 5);
    let book = ledger.order_book(DEFAULT_ASSET);
    assert!(book.bids.is_empty() && book.asks.is_empty());

    // Both legs are same-shard: held now, applied by the next block.
    assert_eq!(ledger.available(&seller, DEFAULT_ASSET), 0);
    ledger.mine_shard(ShardId(0), "miner").unwrap().unwrap();

    assert_eq!(ledger.balance(&buyer, DEFAULT_ASSET), units(5));
    assert_eq!(ledger.balance(&seller, "USD"), units(50));
    assert_eq!(ledger.balance(&seller, DEFAULT_ASSET), 0);
    assert_eq!(ledger.balance(&buyer, "USD"), 0);

    assert!(ledger.match_orders(DEFAULT_ASSET).unwrap().is_empty());
}

#[test]
fn test_unreachable_destination_parks_in_escrow() {
    let ledger = ledger_with(1);
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 1);
    ledger.credit(&a, DEFAULT_ASSET, units(20)).unwrap();
    ledger.set_shard_reachable(ShardId(1), false).unwrap();

    let tx = Transaction::new(&a, &b, units(5), DEFAULT_ASSET).unwrap();
    let id = tx.hash();
    assert!(matches!(
        ledger.submit_transaction(tx),
        Err(LedgerError::Coordinator(_))
    ));
    assert_eq!(ledger.transfer_state(&id), Some(TransferState::Prepared));
    assert_eq!(ledger.balance(ESCROW_ACCOUNT, DEFAULT_ASSET), units(5));
    assert_eq!(ledger.snapshot().in_flight.len(), 1);

    ledger.set_shard_reachable(ShardId(1), true).unwrap();
    let results = ledger.retry_cross_shard();
    assert_eq!(results.len(), 1);
    assert_eq!(ledger.balance(&b, DEFAULT_ASSET), units(5));
    assert_eq!(ledger.balance(ESCROW_ACCOUNT, DEFAULT_ASSET), 0);
}

#[test]
fn test_compensation_refunds_sender() {
    let ledger = ledger_with(1);
    let a = account(&ledger, "A", 2);
    let b = account(&ledger, "B", 0);
    ledger.credit(&a, DEFAULT_ASSET, units(20)).unwrap();
    ledger.set_shard_reachable(ShardId(0), false).unwrap();

    let tx = Transaction::new(&a, &b, units(5), DEFAULT_ASSET).unwrap();
    let id = tx.hash();
    let _ = ledger.submit_transaction(tx);

    assert_eq!(ledger.compensate_transfer(&id).unwrap(), TransferState::Aborted);
    assert_eq!(ledger.balance(&a, DEFAULT_ASSET), units(20));
    assert_eq!(ledger.balance(&b, DEFAULT_ASSET), 0);
}

#[test]
fn test_signatures_required() {
    let mut config = LedgerConfig::default();
    config.require_signatures = true;
    config.consensus.initial_difficulty = 1;
    let ledger = ShardedLedger::new(config).unwrap();
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 0);
    ledger.credit(&a, DEFAULT_ASSET, units(10)).unwrap();

    let unsigned = Transaction::new(&a, &b, units(1), DEFAULT_ASSET).unwrap();
    assert!(matches!(
        ledger.submit_transaction(unsigned.clone()),
        Err(LedgerError::Validation(ValidationError::MissingSignature))
    ));

    let key = SigningKey::from_bytes(&[9u8; 32]);
    let signed = sign_ed25519(&key, unsigned);
    assert!(ledger.submit_transaction(signed.clone()).is_ok());

    let other = Transaction::new(&a, &b, units(2), DEFAULT_ASSET).unwrap();
    let stolen = signed.signature().cloned().unwrap();
    assert!(matches!(
        ledger.submit_transaction(other.with_signature(stolen)),
        Err(LedgerError::Validation(ValidationError::InvalidSignature(_)))
    ));
}

#[test]
fn test_message_dispatch() {
    let ledger = ledger_with(1);
    let a = account(&ledger, "A", 1);
    let b = account(&ledger, "B", 1);
    ledger.credit(&a, DEFAULT_ASSET, units(3)).unwrap();

    let tx = Transaction::new(&a, &b, units(1), DEFAULT_ASSET).unwrap();
    let raw = serde_json::to_string(&InboundMessage::Transaction(tx)).unwrap();
    let reply = ledger
        .handle_message(InboundMessage::from_json(&raw).unwrap())
        .unwrap();
    assert!(matches!(
        reply,
        OutboundMessage::TransactionAccepted(SubmitOutcome::Queued { shard: ShardId(1), .. })
    ));

    let mined = ledger.mine_shard(ShardId(1), "miner").unwrap().unwrap();
    let reply = ledger
        .handle_message(InboundMessage::SyncRequest {
            shard_id: ShardId(1),
            from_index: 1,
        })
        .unwrap();
    assert_eq!(
        reply,
        OutboundMessage::SyncResponse {
            shard_id: ShardId(1),
            blocks: vec![mined],
        }
    );
}

#[test]
fn test_block_message_syncs_follower() {
    let producer = ledger_with(1);
    let follower = ledger_with(1);
    let a = account(&producer, "A", 2);
    let b = account(&producer, "B", 2);
    producer.credit(&a, DEFAULT_ASSET, units(3)).unwrap();
    follower.credit(&a, DEFAULT_ASSET, units(3)).unwrap();

    producer
        .submit_transaction(Transaction::new(&a, &b, units(2), DEFAULT_ASSET).unwrap())
        .unwrap();
    let block = producer.mine_shard(ShardId(2), "miner").unwrap().unwrap();

    let reply = follower
        .handle_message(InboundMessage::Block {
            shard_id: ShardId(2),
            block: block.clone(),
        })
        .unwrap();
    assert_eq!(
        reply,
        OutboundMessage::BlockAccepted {
            shard_id: ShardId(2),
            index: 1
        }
    );
    assert_eq!(follower.balance(&b, DEFAULT_ASSET), units(2));

    // Replaying the same block is a fork conflict, not a second application.
    assert!(follower.receive_block(ShardId(2), block).is_err());
    assert_eq!(follower.balance(&b, DEFAULT_ASSET), units(2));
}

#[test]
fn test_mine_all_and_snapshot_serializes() {
    let ledger = ledger_with(1);
    for shard in 0..3 {
        let a = account(&ledger, "A", shard);
        let b = account(&ledger, "B", shard);
        ledger.credit(&a, DEFAULT_ASSET, units(2)).unwrap();
        ledger
            .submit_transaction(Transaction::new(&a, &b, units(1), DEFAULT_ASSET).unwrap())
            .unwrap();
    }

    let results = ledger.mine_all("miner");
    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        assert_eq!(result.as_ref().unwrap().as_ref().unwrap().index, 1);
    }

    let snapshot = ledger.snapshot();
    assert!(snapshot.shards.iter().all(|s| s.chain.len() == 2));
    assert!(ledger.carbon_balance("miner") >= units(3));
    let json = snapshot.to_json_pretty().unwrap();
    let restored: quantumfuse::LedgerSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, snapshot);
}

#[test]
fn test_peer_block_replaying_mined_transaction_rejected() {
    let ledger = ledger_with(1);
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 0);
    ledger.credit(&a, DEFAULT_ASSET, units(10)).unwrap();

    let tx = Transaction::new(&a, &b, units(2), DEFAULT_ASSET).unwrap();
    ledger.submit_transaction(tx.clone()).unwrap();
    ledger.mine_shard(ShardId(0), "miner").unwrap().unwrap();
    let height = ledger.chain(ShardId(0)).unwrap().len();

    let replay = peer_block(&ledger, ShardId(0), vec![tx]);
    assert!(matches!(
        ledger.receive_block(ShardId(0), replay),
        Err(LedgerError::State(LedgerStateError::Validation(
            ValidationError::DuplicateTransaction(_)
        )))
    ));
    assert_eq!(ledger.balance(&b, DEFAULT_ASSET), units(2));
    assert_eq!(ledger.balance(&a, DEFAULT_ASSET), units(8));
    assert_eq!(ledger.chain(ShardId(0)).unwrap().len(), height);
}

#[test]
fn test_peer_block_minting_unmined_rewards_rejected() {
    let ledger = ledger_with(1);
    let asset = ledger.config().consensus.reward_asset.clone();
    let before = ledger.total_supply(&asset);

    let rewards: Vec<Transaction> = (0..20)
        .map(|n| reward(&ledger, "thief", ShardId(0), 900 + n))
        .collect();
    let block = peer_block(&ledger, ShardId(0), rewards);
    assert!(matches!(
        ledger.receive_block(ShardId(0), block),
        Err(LedgerError::Consensus(ConsensusError::InvalidIssuance { .. }))
    ));
    assert_eq!(ledger.total_supply(&asset), before);
    assert_eq!(ledger.balance("thief", &asset), 0);
    assert_eq!(ledger.chain(ShardId(0)).unwrap().len(), 1);
}

#[test]
fn test_peer_block_repaying_reward_rejected() {
    let ledger = ledger_with(1);
    let asset = ledger.config().consensus.reward_asset.clone();
    let a = account(&ledger, "A", 0);
    let b = account(&ledger, "B", 0);
    ledger.credit(&a, DEFAULT_ASSET, units(1)).unwrap();
    ledger
        .submit_transaction(Transaction::new(&a, &b, units(1), DEFAULT_ASSET).unwrap())
        .unwrap();

    ledger.mine_shard(ShardId(0), "miner").unwrap().unwrap();
    ledger.mine_shard(ledger.shard_of("miner"), "miner").unwrap().unwrap();
    let paid = ledger.balance("miner", &asset);
    assert_eq!(paid, ledger.config().consensus.reward_amount);

    let twice = reward(&ledger, "thief", ShardId(0), 1);
    let block = peer_block(&ledger, ShardId(0), vec![twice]);
    assert!(matches!(
        ledger.receive_block(ShardId(0), block),
        Err(LedgerError::State(LedgerStateError::DuplicateIssuance(_)))
    ));
    assert_eq!(ledger.balance("thief", &asset), 0);
    assert_eq!(ledger.balance("miner", &asset), paid);
}
