use crate::order::{Order, Side};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub bids: Vec<Order>,
    pub asks: Vec<Order>,
}

/// Sorted resting orders for one asset.
///
/// INVARIANTS:
/// 1. bids: price descending, then seq ascending
/// 2. asks: price ascending, then seq ascending
/// 3. every resting order has quantity > 0
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    bids: Vec<Order>,
    asks: Vec<Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: Order) {
        match order.side {
            Side::Buy => {
                let at = self.bids.partition_point(|o| {
                    o.price > order.price || (o.price == order.price && o.seq < order.seq)
                });
                self.bids.insert(at, order);
            }
            Side::Sell => {
                let at = self.asks.partition_point(|o| {
                    o.price < order.price || (o.price == order.price && o.seq < order.seq)
                });
                self.asks.insert(at, order);
            }
        }
    }

    pub fn best_bid(&self) -> Option<&Order> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Order> {
        self.asks.first()
    }

    /// Best bid price at or above best ask price.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    pub fn remove(&mut self, seq: u64) -> Option<Order> {
        if let Some(at) = self.bids.iter().position(|o| o.seq == seq) {
            return Some(self.bids.remove(at));
        }
        let at = self.asks.iter().position(|o| o.seq == seq)?;
        Some(self.asks.remove(at))
    }

    /// Reduce the head order on `side` by `quantity`, dropping it once filled.
    pub(crate) fn fill_head(&mut self, side: Side, quantity: u64) {
        let orders = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if let Some(head) = orders.first_mut() {
            head.quantity = head.quantity.saturating_sub(quantity);
            if head.quantity == 0 {
                orders.remove(0);
            }
        }
    }

    pub(crate) fn pop_head(&mut self, side: Side) -> Option<Order> {
        let orders = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if orders.is_empty() {
            None
        } else {
            Some(orders.remove(0))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
        }
    }
}
