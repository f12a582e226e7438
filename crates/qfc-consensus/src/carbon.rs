// Carbon credits: a side ledger rewarded by green mining
//
// Credits never touch the asset ledger. One credit is UNIT base units, so a
// 1.2x solar award is exactly 120_000_000.

use crate::pow_engine::EnergySource;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use qfc_core::{Amount, UNIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CarbonError {
    #[error("credit amount must be greater than zero")]
    ZeroAmount,

    #[error("{account} holds {available} credits, {required} required")]
    InsufficientCredits {
        account: String,
        available: Amount,
        required: Amount,
    },

    #[error("market pool holds {available} credits, {required} requested")]
    InsufficientPool { available: Amount, required: Amount },

    #[error("credit arithmetic overflow")]
    Overflow,
}

/// Base credit per mined block, before the energy multiplier.
pub const BASE_CREDIT: Amount = UNIT;

#[derive(Debug, Default)]
pub struct CarbonCreditLedger {
    credits: RwLock<BTreeMap<String, Amount>>,
}

impl CarbonCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a miner for one block mined on `source`. Returns the award.
    pub fn award(&self, miner: &str, source: EnergySource) -> Result<Amount, CarbonError> {
        let award = BASE_CREDIT * Amount::from(source.multiplier_permille()) / 1_000;
        self.credit(miner, award)?;
        info!("Awarded {} carbon credits to {} ({})", award, miner, source);
        Ok(award)
    }

    pub fn balance(&self, account: &str) -> Amount {
        self.credits.read().get(account).copied().unwrap_or(0)
    }

    pub fn credit(&self, account: &str, amount: Amount) -> Result<(), CarbonError> {
        if amount == 0 {
            return Err(CarbonError::ZeroAmount);
        }
        let mut credits = self.credits.write();
        let entry = credits.entry(account.to_string()).or_insert(0);
        *entry = entry.checked_add(amount).ok_or(CarbonError::Overflow)?;
        Ok(())
    }

    pub fn debit(&self, account: &str, amount: Amount) -> Result<(), CarbonError> {
        if amount == 0 {
            return Err(CarbonError::ZeroAmount);
        }
        let mut credits = self.credits.write();
        let available = credits.get(account).copied().unwrap_or(0);
        if available < amount {
            return Err(CarbonError::InsufficientCredits {
                account: account.to_string(),
                available,
                required: amount,
            });
        }
        credits.insert(account.to_string(), available - amount);
        Ok(())
    }

    /// Move credits between holders under one write lock.
    pub fn transfer(&self, from: &str, to: &str, amount: Amount) -> Result<(), CarbonError> {
        if amount == 0 {
            return Err(CarbonError::ZeroAmount);
        }
        let mut credits = self.credits.write();
        let available = credits.get(from).copied().unwrap_or(0);
        if available < amount {
            return Err(CarbonError::InsufficientCredits {
                account: from.to_string(),
                available,
                required: amount,
            });
        }
        let target = credits.get(to).copied().unwrap_or(0);
        let updated = target.checked_add(amount).ok_or(CarbonError::Overflow)?;
        credits.insert(from.to_string(), available - amount);
        credits.insert(to.to_string(), updated);
        debug!("Moved {} carbon credits {} -> {}", amount, from, to);
        Ok(())
    }

    pub fn total(&self) -> Amount {
        self.credits.read().values().sum()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Amount> {
        self.credits
            .read()
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|(account, amount)| (account.clone(), *amount))
            .collect()
    }
}

/// Public state of the credit market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketQuote {
    /// Price of one credit, in QFC base units.
    pub price: Amount,
    pub pool: Amount,
    pub buy_volume: Amount,
    pub sell_volume: Amount,
}

/// Pool-based credit market with a volume-driven quoted price.
///
/// The price is only quoted: settling it in QFC is left to the caller.
pub struct CarbonCreditMarket {
    ledger: Arc<CarbonCreditLedger>,
    state: Mutex<MarketQuote>,
}

impl CarbonCreditMarket {
    pub fn new(ledger: Arc<CarbonCreditLedger>, initial_price: Amount) -> Self {
        CarbonCreditMarket {
            ledger,
            state: Mutex::new(MarketQuote {
                price: initial_price,
                pool: 0,
                buy_volume: 0,
                sell_volume: 0,
            }),
        }
    }

    /// Move a holder's credits into the pool. Returns the quoted proceeds.
    pub fn sell_credits(&self, seller: &str, amount: Amount) -> Result<Amount, CarbonError> {
        let mut state = self.state.lock();
        self.ledger.debit(seller, amount)?;
        state.pool += amount;
        state.sell_volume += amount;
        let proceeds = quote(state.price, amount);
        info!("{} sold {} carbon credits for {}", seller, amount, proceeds);
        Ok(proceeds)
    }

    /// Take credits out of the pool. Returns the quoted cost.
    pub fn buy_credits(&self, buyer: &str, amount: Amount) -> Result<Amount, CarbonError> {
        if amount == 0 {
            return Err(CarbonError::ZeroAmount);
        }
        let mut state = self.state.lock();
        if state.pool < amount {
            return Err(CarbonError::InsufficientPool {
                available: state.pool,
                required: amount,
            });
        }
        self.ledger.credit(buyer, amount)?;
        state.pool -= amount;
        state.buy_volume += amount;
        let cost = quote(state.price, amount);
        info!("{} bought {} carbon credits for {}", buyer, amount, cost);
        Ok(cost)
    }

    /// +10% when buying outpaced selling, -10% when selling outpaced buying;
    /// then the volume window resets.
    pub fn adjust_price(&self) -> Amount {
        let mut state = self.state.lock();
        if state.buy_volume > state.sell_volume {
            state.price = state.price * 11 / 10;
        } else if state.buy_volume < state.sell_volume {
            state.price = state.price * 9 / 10;
        }
        state.buy_volume = 0;
        state.sell_volume = 0;
        info!("Carbon credit price adjusted to {}", state.price);
        state.price
    }

    pub fn quote(&self) -> MarketQuote {
        self.state.lock().clone()
    }
}

fn quote(price: Amount, credits: Amount) -> Amount {
    price.saturating_mul(credits) / UNIT
}
