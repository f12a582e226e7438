use qfc_core::{Amount, UNIT};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// An order as submitted, before the engine assigns a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user: String,
    pub asset: String,
    pub side: Side,
    /// Whole units of `asset`.
    pub quantity: u64,
    /// Quote-asset base units per whole unit of `asset`.
    pub price: Amount,
}

impl OrderRequest {
    pub fn buy(user: impl Into<String>, asset: impl Into<String>, quantity: u64, price: Amount) -> Self {
        OrderRequest {
            user: user.into(),
            asset: asset.into(),
            side: Side::Buy,
            quantity,
            price,
        }
    }

    pub fn sell(user: impl Into<String>, asset: impl Into<String>, quantity: u64, price: Amount) -> Self {
        OrderRequest {
            user: user.into(),
            asset: asset.into(),
            side: Side::Sell,
            quantity,
            price,
        }
    }
}

/// A resting order. `seq` is unique per engine and breaks price ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub seq: u64,
    pub user: String,
    pub asset: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Amount,
}

/// One fill between a resting buy and a resting sell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub asset: String,
    pub quote_asset: String,
    pub buyer: String,
    pub seller: String,
    pub buy_seq: u64,
    pub sell_seq: u64,
    pub quantity: u64,
    /// Midpoint of the two limit prices, rounded down.
    pub price: Amount,
}

impl Trade {
    /// Asset leg (seller -> buyer), in base units.
    pub fn asset_amount(&self) -> Option<Amount> {
        Amount::from(self.quantity).checked_mul(UNIT)
    }

    /// Quote leg (buyer -> seller): quantity x price.
    pub fn quote_amount(&self) -> Option<Amount> {
        Amount::from(self.quantity).checked_mul(self.price)
    }
}
