// Fiat on-ramp: payment first, issuance second

use crate::error::LedgerError;
use crate::ledger::ShardedLedger;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use qfc_core::{Amount, ValidationError, DEFAULT_ASSET, UNIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// External payment gateway. Returns the decline reason on failure.
pub trait PaymentProcessor: Send + Sync {
    fn process(&self, user: &str, fiat_amount: Amount, currency: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub user: String,
    pub currency: String,
    pub fiat_amount: Amount,
    pub qfc_amount: Amount,
}

/// Most recent purchases kept for inspection.
const RECENT_PURCHASES: usize = 100;

pub struct OnRamp {
    /// Fiat per QFC, scaled by UNIT (0.85 EUR is 85_000_000).
    rates: RwLock<BTreeMap<String, Amount>>,
    processor: Box<dyn PaymentProcessor>,
    recent: Mutex<Vec<Purchase>>,
}

impl OnRamp {
    pub fn new(processor: Box<dyn PaymentProcessor>) -> Self {
        let rates = BTreeMap::from([
            ("USD".to_string(), UNIT),
            ("EUR".to_string(), 85_000_000),
            ("JPY".to_string(), 110 * UNIT),
        ]);
        OnRamp {
            rates: RwLock::new(rates),
            processor,
            recent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_rate(&self, currency: &str, rate: Amount) -> Result<(), LedgerError> {
        if rate == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        self.rates.write().insert(currency.to_string(), rate);
        Ok(())
    }

    pub fn rate(&self, currency: &str) -> Option<Amount> {
        self.rates.read().get(currency).copied()
    }

    /// QFC bought by `fiat_amount` base units of `currency`.
    pub fn quote(&self, fiat_amount: Amount, currency: &str) -> Result<Amount, LedgerError> {
        let rate = self
            .rate(currency)
            .ok_or_else(|| LedgerError::UnsupportedCurrency(currency.to_string()))?;
        let scaled = fiat_amount
            .checked_mul(UNIT)
            .ok_or(ValidationError::Overflow)?;
        Ok(scaled / rate)
    }

    /// Charge the user, then credit the converted QFC amount.
    pub fn buy_qfc(
        &self,
        ledger: &ShardedLedger,
        user: &str,
        fiat_amount: Amount,
        currency: &str,
    ) -> Result<Amount, LedgerError> {
        if fiat_amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        let qfc_amount = self.quote(fiat_amount, currency)?;
        if qfc_amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }

        if let Err(reason) = self.processor.process(user, fiat_amount, currency) {
            warn!("Payment of {} {} by {} declined: {}", fiat_amount, currency, user, reason);
            return Err(LedgerError::PaymentDeclined {
                user: user.to_string(),
                reason,
            });
        }

        ledger.credit(user, DEFAULT_ASSET, qfc_amount)?;
        info!("{} bought {} QFC for {} {}", user, qfc_amount, fiat_amount, currency);

        let mut recent = self.recent.lock();
        recent.push(Purchase {
            user: user.to_string(),
            currency: currency.to_string(),
            fiat_amount,
            qfc_amount,
        });
        if recent.len() > RECENT_PURCHASES {
            let excess = recent.len() - RECENT_PURCHASES;
            recent.drain(..excess);
        }
        Ok(qfc_amount)
    }

    pub fn recent_purchases(&self) -> Vec<Purchase> {
        self.recent.lock().clone()
    }
}
