// Trade settlement: both legs held before either moves
//
// SAFETY INVARIANTS:
// 1. The seller's delivery is held first, then the buyer's payment
// 2. A failed payment hold releases the delivery hold; no leg moves
// 3. Held legs travel the ordinary routes (shard queue or 2PC)
// 4. A delivery that fails to complete releases the payment hold

use crate::error::LedgerError;
use crate::ledger::ShardedLedger;
use log::{debug, error, warn};
use qfc_core::{ShardId, Transaction, TxHash};
use qfc_exchange::{SettlementError, Trade, TradeSettlement};
use qfc_state::CoordinatorError;

/// Funds earmarked for one leg of a trade.
enum Hold {
    Local { shard: ShardId, tx: Transaction },
    CrossShard { id: TxHash },
}

impl ShardedLedger {
    /// Delivery (seller -> buyer, asset) and payment (buyer -> seller, quote).
    fn trade_legs(&self, trade: &Trade) -> Result<(Transaction, Transaction), String> {
        let delivered = trade
            .asset_amount()
            .ok_or_else(|| format!("asset amount overflows for {} units", trade.quantity))?;
        let paid = trade
            .quote_amount()
            .ok_or_else(|| format!("quote amount overflows for {} x {}", trade.quantity, trade.price))?;
        let nonce = (trade.buy_seq << 32) | (trade.sell_seq & 0xFFFF_FFFF);

        let delivery = Transaction::new(&trade.seller, &trade.buyer, delivered, trade.asset.as_str())
            .map_err(|e| e.to_string())?
            .with_nonce(nonce);
        let payment = Transaction::new(&trade.buyer, &trade.seller, paid, trade.quote_asset.as_str())
            .map_err(|e| e.to_string())?
            .with_nonce(nonce);
        Ok((delivery, payment))
    }

    fn hold(&self, tx: Transaction) -> Result<Hold, LedgerError> {
        let id = tx.hash();
        let (source, destination) = self.router.endpoints(&tx);

        let hold = if source != destination {
            self.coordinator.initiate(tx)?;
            self.coordinator.prepare(&id)?;
            Hold::CrossShard { id }
        } else {
            self.ledger.reserve(id, tx.sender(), tx.asset(), tx.amount())?;
            Hold::Local { shard: source, tx }
        };
        self.seen.insert(id);
        Ok(hold)
    }

    fn release_hold(&self, hold: Hold) {
        let result = match &hold {
            Hold::Local { tx, .. } => self.ledger.release(&tx.hash()).map(|_| ()).map_err(LedgerError::from),
            Hold::CrossShard { id } => self.coordinator.abort(id).map(|_| ()).map_err(LedgerError::from),
        };
        if let Err(err) = result {
            warn!("Could not release settlement hold: {}", err);
        }
    }

    fn complete(&self, hold: Hold) -> Result<(), SettlementError> {
        match hold {
            Hold::Local { shard, tx } => {
                let shard = self
                    .shard(shard)
                    .map_err(|e| SettlementError::Failed(e.to_string()))?;
                shard.submit(tx);
                Ok(())
            }
            Hold::CrossShard { id } => match self.coordinator.commit_with_retry(&id) {
                Ok(_) => Ok(()),
                // Funds sit in escrow; retry_cross_shard finishes the leg.
                Err(CoordinatorError::RetriesExhausted { .. }) => {
                    error!("Settlement leg {} parked in escrow", id.short());
                    Ok(())
                }
                Err(err) => {
                    if let Err(abort_err) = self.coordinator.abort(&id) {
                        warn!("Could not abort settlement leg {}: {}", id.short(), abort_err);
                    }
                    Err(SettlementError::Failed(err.to_string()))
                }
            },
        }
    }

    fn complete_legs(&self, delivery: Hold, payment: Hold) -> Result<(), SettlementError> {
        if let Err(err) = self.complete(delivery) {
            self.release_hold(payment);
            return Err(err);
        }
        self.complete(payment)
    }
}

impl TradeSettlement for ShardedLedger {
    fn settle(&self, trade: &Trade) -> Result<(), SettlementError> {
        let (delivery, payment) = self.trade_legs(trade).map_err(SettlementError::Failed)?;

        let delivery = self
            .hold(delivery)
            .map_err(|e| SettlementError::SellerCannotDeliver(e.to_string()))?;
        let payment = match self.hold(payment) {
            Ok(hold) => hold,
            Err(err) => {
                self.release_hold(delivery);
                return Err(SettlementError::BuyerCannotPay(err.to_string()));
            }
        };

        self.complete_legs(delivery, payment)?;
        debug!(
            "Settled trade #{}/#{}: {} -> {}",
            trade.buy_seq, trade.sell_seq, trade.seller, trade.buyer
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LedgerConfig;
    use crate::ledger::ShardedLedger;
    use qfc_core::{units, ShardId, Transaction, DEFAULT_ASSET};
    use qfc_exchange::OrderRequest;

    fn ledger() -> ShardedLedger {
        let mut config = LedgerConfig::default();
        config.consensus.initial_difficulty = 1;
        config.retry = qfc_state::RetryPolicy::immediate(2);
        ShardedLedger::new(config).unwrap()
    }

    #[test]
    fn test_broke_buyer_releases_seller_hold() {
        let ledger = ledger();
        let router = ledger.router();
        let seller = router.account_on("seller", ShardId(0)).unwrap();
        let buyer = router.account_on("buyer", ShardId(0)).unwrap();
        ledger.credit(&seller, DEFAULT_ASSET, units(5)).unwrap();

        ledger
            .place_order(OrderRequest::sell(&seller, DEFAULT_ASSET, 5, units(10)))
            .unwrap();
        ledger
            .place_order(OrderRequest::buy(&buyer, DEFAULT_ASSET, 5, units(10)))
            .unwrap();

        assert!(ledger.match_orders(DEFAULT_ASSET).unwrap().is_empty());
        assert_eq!(ledger.available(&seller, DEFAULT_ASSET), units(5));
        assert!(ledger.order_book(DEFAULT_ASSET).bids.is_empty());
        assert_eq!(ledger.order_book(DEFAULT_ASSET).asks.len(), 1);
    }

    #[test]
    fn test_cross_shard_trade_settles_immediately() {
        let ledger = ledger();
        let router = ledger.router();
        let seller = router.account_on("seller", ShardId(1)).unwrap();
        let buyer = router.account_on("buyer", ShardId(2)).unwrap();
        ledger.credit(&seller, DEFAULT_ASSET, units(3)).unwrap();
        ledger.credit(&buyer, "USD", units(100)).unwrap();

        ledger
            .place_order(OrderRequest::sell(&seller, DEFAULT_ASSET, 3, units(8)))
            .unwrap();
        ledger
            .place_order(OrderRequest::buy(&buyer, DEFAULT_ASSET, 3, units(12)))
            .unwrap();

        let trades = ledger.match_orders(DEFAULT_ASSET).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, units(10));
        assert_eq!(ledger.balance(&buyer, DEFAULT_ASSET), units(3));
        assert_eq!(ledger.balance(&seller, "USD"), units(30));
        assert_eq!(ledger.balance(&buyer, "USD"), units(70));
    }

    #[test]
    fn test_failed_delivery_releases_payment_hold() {
        let ledger = ledger();
        let router = ledger.router();
        let seller = router.account_on("seller", ShardId(1)).unwrap();
        let buyer = router.account_on("buyer", ShardId(2)).unwrap();
        ledger.credit(&seller, DEFAULT_ASSET, units(3)).unwrap();
        ledger.credit(&buyer, "USD", units(100)).unwrap();

        let delivery = Transaction::new(&seller, &buyer, units(3), DEFAULT_ASSET).unwrap();
        let payment = Transaction::new(&buyer, &seller, units(30), "USD").unwrap();
        let delivery_id = delivery.hash();
        let delivery = ledger.hold(delivery).unwrap();
        let payment = ledger.hold(payment).unwrap();
        assert_eq!(ledger.available(&buyer, "USD"), units(70));

        // Without its reservation the delivery commit cannot apply.
        ledger.ledger.release(&delivery_id).unwrap();
        assert!(ledger.complete_legs(delivery, payment).is_err());

        assert_eq!(ledger.available(&buyer, "USD"), units(100));
        assert_eq!(ledger.balance(&seller, "USD"), 0);
        assert_eq!(ledger.balance(&buyer, DEFAULT_ASSET), 0);
        assert_eq!(ledger.available(&seller, DEFAULT_ASSET), units(3));
    }
}
