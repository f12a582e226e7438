// Exchange engine: per-asset books, validation, matching
//
// SAFETY INVARIANTS:
// 1. Only validated orders rest on a book
// 2. A fill is removed from the book only after its settlement succeeded
// 3. An order whose owner cannot settle is removed; matching continues
// 4. Matching a non-crossing book changes nothing

use crate::order::{Order, OrderRequest, Side, Trade};
use crate::order_book::{BookSnapshot, OrderBook};
use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use qfc_core::ValidationError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a trade could not settle, and whose order is at fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("seller cannot deliver: {0}")]
    SellerCannotDeliver(String),

    #[error("buyer cannot pay: {0}")]
    BuyerCannotPay(String),

    /// Neither party is at fault; matching stops.
    #[error("settlement failed: {0}")]
    Failed(String),
}

/// Moves both legs of a trade. Implemented by the ledger facade.
pub trait TradeSettlement {
    fn settle(&self, trade: &Trade) -> Result<(), SettlementError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no resting order {seq} on the {asset} book")]
    UnknownOrder { asset: String, seq: u64 },

    #[error("matching on {asset} halted after {} trades: {reason}", .settled.len())]
    SettlementHalted {
        asset: String,
        reason: String,
        settled: Vec<Trade>,
    },
}

pub struct ExchangeEngine {
    quote_asset: String,
    books: DashMap<String, Arc<Mutex<OrderBook>>>,
    next_seq: AtomicU64,
}

impl ExchangeEngine {
    pub fn new(quote_asset: impl Into<String>) -> Self {
        ExchangeEngine {
            quote_asset: quote_asset.into(),
            books: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    fn book_handle(&self, asset: &str) -> Arc<Mutex<OrderBook>> {
        if let Some(book) = self.books.get(asset) {
            return book.value().clone();
        }
        self.books
            .entry(asset.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn validate(&self, request: &OrderRequest) -> Result<(), ValidationError> {
        if request.user.is_empty() {
            return Err(ValidationError::MalformedOrder("user must not be empty".into()));
        }
        if request.asset.is_empty() {
            return Err(ValidationError::MalformedOrder("asset must not be empty".into()));
        }
        if request.asset == self.quote_asset {
            return Err(ValidationError::MalformedOrder(format!(
                "{} is the quote asset",
                request.asset
            )));
        }
        if request.quantity == 0 {
            return Err(ValidationError::MalformedOrder("quantity must be positive".into()));
        }
        if request.price == 0 {
            return Err(ValidationError::MalformedOrder("price must be positive".into()));
        }
        Ok(())
    }

    /// Validate and rest an order, assigning the next sequence number.
    pub fn place_order(&self, request: OrderRequest) -> Result<Order, ExchangeError> {
        self.validate(&request)?;
        let order = Order {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            user: request.user,
            asset: request.asset,
            side: request.side,
            quantity: request.quantity,
            price: request.price,
        };
        self.book_handle(&order.asset).lock().insert(order.clone());
        info!(
            "Placed {:?} order #{} for {} {} @ {} by {}",
            order.side, order.seq, order.quantity, order.asset, order.price, order.user
        );
        Ok(order)
    }

    pub fn cancel_order(&self, asset: &str, seq: u64) -> Result<Order, ExchangeError> {
        let handle = self.books.get(asset).map(|book| book.value().clone());
        let removed = match handle {
            Some(book) => {
                let removed = book.lock().remove(seq);
                removed
            }
            None => None,
        };
        let order = removed.ok_or_else(|| ExchangeError::UnknownOrder {
            asset: asset.to_string(),
            seq,
        })?;
        info!("Cancelled order #{} on {}", seq, asset);
        Ok(order)
    }

    pub fn book(&self, asset: &str) -> BookSnapshot {
        let handle = self.books.get(asset).map(|book| book.value().clone());
        match handle {
            Some(book) => {
                let snapshot = book.lock().snapshot();
                snapshot
            }
            None => BookSnapshot::default(),
        }
    }

    pub fn books(&self) -> BTreeMap<String, BookSnapshot> {
        let handles: Vec<(String, Arc<Mutex<OrderBook>>)> = self
            .books
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        handles
            .iter()
            .map(|(asset, book)| (asset.clone(), book.lock().snapshot()))
            .filter(|(_, snapshot)| !snapshot.bids.is_empty() || !snapshot.asks.is_empty())
            .collect()
    }

    pub fn best_bid(&self, asset: &str) -> Option<Order> {
        self.book(asset).bids.into_iter().next()
    }

    pub fn best_ask(&self, asset: &str) -> Option<Order> {
        self.book(asset).asks.into_iter().next()
    }

    /// Match crossing orders on `asset` until the book no longer crosses.
    ///
    /// Each fill trades `min(q_buy, q_sell)` at the midpoint price and is
    /// settled before the book is updated.
    pub fn match_orders(
        &self,
        asset: &str,
        settlement: &dyn TradeSettlement,
    ) -> Result<Vec<Trade>, ExchangeError> {
        let Some(handle) = self.books.get(asset).map(|book| book.value().clone()) else {
            return Ok(Vec::new());
        };
        let mut book = handle.lock();
        let mut trades = Vec::new();

        loop {
            let (bid, ask) = match (book.best_bid(), book.best_ask()) {
                (Some(bid), Some(ask)) if bid.price >= ask.price => (bid.clone(), ask.clone()),
                _ => break,
            };

            if bid.user == ask.user {
                // A user cannot fill against themselves; the later order yields.
                let stale = if bid.seq > ask.seq { Side::Buy } else { Side::Sell };
                if let Some(dropped) = book.pop_head(stale) {
                    warn!("Dropped self-crossing order #{} by {}", dropped.seq, dropped.user);
                }
                continue;
            }

            let trade = Trade {
                asset: asset.to_string(),
                quote_asset: self.quote_asset.clone(),
                buyer: bid.user.clone(),
                seller: ask.user.clone(),
                buy_seq: bid.seq,
                sell_seq: ask.seq,
                quantity: bid.quantity.min(ask.quantity),
                price: bid.price / 2 + ask.price / 2 + (bid.price % 2 + ask.price % 2) / 2,
            };

            match settlement.settle(&trade) {
                Ok(()) => {
                    book.fill_head(Side::Buy, trade.quantity);
                    book.fill_head(Side::Sell, trade.quantity);
                    info!(
                        "Trade {} {} @ {}: {} -> {}",
                        trade.quantity, trade.asset, trade.price, trade.seller, trade.buyer
                    );
                    trades.push(trade);
                }
                Err(SettlementError::SellerCannotDeliver(reason)) => {
                    warn!("Removing sell order #{}: {}", ask.seq, reason);
                    book.pop_head(Side::Sell);
                }
                Err(SettlementError::BuyerCannotPay(reason)) => {
                    warn!("Removing buy order #{}: {}", bid.seq, reason);
                    book.pop_head(Side::Buy);
                }
                Err(SettlementError::Failed(reason)) => {
                    error!("Matching on {} halted: {}", asset, reason);
                    return Err(ExchangeError::SettlementHalted {
                        asset: asset.to_string(),
                        reason,
                        settled: trades,
                    });
                }
            }
        }

        Ok(trades)
    }
}
