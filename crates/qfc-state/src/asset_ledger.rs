// Asset Ledger: account -> asset -> balance
//
// SAFETY INVARIANTS:
// 1. Balances never go negative (unsigned, checked before every debit)
// 2. Every debit path respects reservations (available = total - reserved)
// 3. Multi-entry updates are all-or-nothing
// 4. Transfers conserve per-asset supply; only issuance and credit mint
// 5. An issuance nonce mints at most once across every shard

use crate::cross_shard_locking::{
    with_ordered_locks, Balance, BalanceCell, BalanceKey, Reservation, StagedBalances,
};
use crate::error::LedgerStateError;
use dashmap::{DashMap, DashSet};
use log::{debug, info};
use qfc_core::{Amount, Transaction, TxHash};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Holding account for source-debited funds whose destination leg has not landed.
pub const ESCROW_ACCOUNT: &str = "__escrow__";

/// Serializable view of every non-empty balance entry.
pub type BalanceSnapshot = BTreeMap<String, BTreeMap<String, Balance>>;

/// The single source of truth for balances, shared by handle across shards.
#[derive(Default)]
pub struct AssetLedger {
    balances: DashMap<BalanceKey, BalanceCell>,
    reservations: DashMap<TxHash, Reservation>,
    issued: DashSet<u64>,
}

impl AssetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &BalanceKey) -> BalanceCell {
        if let Some(cell) = self.balances.get(key) {
            return cell.value().clone();
        }
        self.balances.entry(key.clone()).or_default().value().clone()
    }

    /// Run `work` with every entry in `keys` locked in ascending order.
    fn with_locked<R>(
        &self,
        keys: BTreeSet<BalanceKey>,
        work: impl FnOnce(&mut StagedBalances) -> Result<R, LedgerStateError>,
    ) -> Result<R, LedgerStateError> {
        let cells: Vec<(BalanceKey, BalanceCell)> = keys
            .into_iter()
            .map(|key| {
                let cell = self.cell(&key);
                (key, cell)
            })
            .collect();

        with_ordered_locks(&cells, work, |staged| {
            for id in &staged.consumed {
                self.reservations.remove(id);
            }
            for (id, reservation) in &staged.created {
                self.reservations.insert(*id, reservation.clone());
            }
        })
    }

    /// Total balance, including any reserved portion.
    pub fn balance(&self, account: &str, asset: &str) -> Amount {
        self.entry(account, asset).total
    }

    pub fn available(&self, account: &str, asset: &str) -> Amount {
        self.entry(account, asset).available()
    }

    pub fn entry(&self, account: &str, asset: &str) -> Balance {
        let key = BalanceKey::new(account, asset);
        let cell = self.balances.get(&key).map(|cell| cell.value().clone());
        match cell {
            Some(cell) => {
                let balance = *cell.lock();
                balance
            }
            None => Balance::default(),
        }
    }

    /// Every asset held by `account`, read under one ordered lock set.
    pub fn balances(&self, account: &str) -> BTreeMap<String, Amount> {
        let keys: BTreeSet<BalanceKey> = self
            .balances
            .iter()
            .filter(|e| e.key().account == account)
            .map(|e| e.key().clone())
            .collect();
        let lookup = keys.clone();
        self.with_locked(keys, |staged| {
            Ok(lookup
                .iter()
                .map(|key| (key.asset.clone(), staged.get(key).total))
                .filter(|(_, total)| *total > 0)
                .collect())
        })
        .unwrap_or_default()
    }

    /// Unconditional issuance.
    pub fn credit(&self, account: &str, asset: &str, amount: Amount) -> Result<(), LedgerStateError> {
        let key = BalanceKey::new(account, asset);
        self.with_locked(BTreeSet::from([key.clone()]), |staged| {
            staged.credit(&key, amount)?;
            Ok(())
        })?;
        debug!("Credited {} {} to {}", amount, asset, account);
        Ok(())
    }

    /// Move available funds between two accounts atomically.
    pub fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Amount,
    ) -> Result<(), LedgerStateError> {
        let source = BalanceKey::new(from, asset);
        let target = BalanceKey::new(to, asset);
        self.with_locked(BTreeSet::from([source.clone(), target.clone()]), |staged| {
            staged.debit_available(&source, amount)?;
            staged.credit(&target, amount)?;
            Ok(())
        })
    }

    /// Earmark `amount` of `account`'s available balance under `id`.
    pub fn reserve(
        &self,
        id: TxHash,
        account: &str,
        asset: &str,
        amount: Amount,
    ) -> Result<(), LedgerStateError> {
        let key = BalanceKey::new(account, asset);
        self.with_locked(BTreeSet::from([key.clone()]), |staged| {
            if self.reservations.contains_key(&id) {
                return Err(LedgerStateError::DuplicateReservation(id.as_hex()));
            }
            staged.reserve(&key, amount)?;
            staged.created.push((id, Reservation { key: key.clone(), amount }));
            Ok(())
        })?;
        debug!("Reserved {} {} of {} for {}", amount, asset, account, id.short());
        Ok(())
    }

    /// Drop a reservation, returning the amount it held. No-op when absent.
    pub fn release(&self, id: &TxHash) -> Result<Option<Amount>, LedgerStateError> {
        let Some(reservation) = self.reservation(id) else {
            return Ok(None);
        };
        let key = reservation.key.clone();
        let released = self.with_locked(BTreeSet::from([key.clone()]), |staged| {
            // Re-check under the lock: a block may have consumed it meanwhile.
            match self.reservations.get(id) {
                Some(current) => {
                    let amount = current.amount;
                    drop(current);
                    staged.unreserve(&key, amount);
                    staged.consumed.push(*id);
                    Ok(Some(amount))
                }
                None => Ok(None),
            }
        })?;
        if released.is_some() {
            debug!("Released reservation {}", id.short());
        }
        Ok(released)
    }

    /// Debit a reservation and credit `recipient` in one step.
    pub fn commit_reserved(&self, id: &TxHash, recipient: &str) -> Result<Amount, LedgerStateError> {
        let reservation = self
            .reservation(id)
            .ok_or_else(|| LedgerStateError::ReservationNotFound(id.as_hex()))?;
        let source = reservation.key.clone();
        let target = BalanceKey::new(recipient, source.asset.clone());
        self.with_locked(BTreeSet::from([source.clone(), target.clone()]), |staged| {
            if !self.reservations.contains_key(id) {
                return Err(LedgerStateError::ReservationNotFound(id.as_hex()));
            }
            staged.debit_reserved(&source, reservation.amount)?;
            staged.credit(&target, reservation.amount)?;
            staged.consumed.push(*id);
            Ok(reservation.amount)
        })
    }

    pub fn reservation(&self, id: &TxHash) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn has_reservation(&self, id: &TxHash) -> bool {
        self.reservations.contains_key(id)
    }

    /// Apply a block's transactions in order, all or nothing.
    ///
    /// Issuance only credits. A transaction holding a matching reservation
    /// consumes it; any other transaction must be covered by available funds.
    pub fn apply_transactions(&self, transactions: &[Transaction]) -> Result<(), LedgerStateError> {
        if transactions.is_empty() {
            return Ok(());
        }

        let mut keys = BTreeSet::new();
        for tx in transactions {
            tx.validate()?;
            if !tx.is_issuance() {
                keys.insert(BalanceKey::new(tx.sender(), tx.asset()));
            }
            keys.insert(BalanceKey::new(tx.recipient(), tx.asset()));
        }

        let claimed = self.claim_issuance(transactions)?;
        let applied = self.with_locked(keys, |staged| {
            for tx in transactions {
                let recipient = BalanceKey::new(tx.recipient(), tx.asset());
                if tx.is_issuance() {
                    staged.credit(&recipient, tx.amount())?;
                    continue;
                }

                let sender = BalanceKey::new(tx.sender(), tx.asset());
                let id = tx.hash();
                let reserved = self
                    .reservations
                    .get(&id)
                    .map(|r| r.key == sender && r.amount == tx.amount())
                    .unwrap_or(false);

                if reserved && !staged.is_consumed(&id) {
                    staged.debit_reserved(&sender, tx.amount())?;
                    staged.consumed.push(id);
                } else {
                    staged.debit_available(&sender, tx.amount())?;
                }
                staged.credit(&recipient, tx.amount())?;
            }
            Ok(())
        });
        if let Err(err) = applied {
            for nonce in &claimed {
                self.issued.remove(nonce);
            }
            return Err(err);
        }

        info!("Applied {} transactions to the asset ledger", transactions.len());
        Ok(())
    }

    /// Claim every issuance nonce in `transactions`, or none of them.
    fn claim_issuance(&self, transactions: &[Transaction]) -> Result<Vec<u64>, LedgerStateError> {
        let mut claimed = Vec::new();
        for tx in transactions.iter().filter(|tx| tx.is_issuance()) {
            if !self.issued.insert(tx.nonce()) {
                for nonce in &claimed {
                    self.issued.remove(nonce);
                }
                debug!("Issuance {:#x} already minted", tx.nonce());
                return Err(LedgerStateError::DuplicateIssuance(tx.nonce()));
            }
            claimed.push(tx.nonce());
        }
        Ok(claimed)
    }

    pub fn is_issued(&self, nonce: u64) -> bool {
        self.issued.contains(&nonce)
    }

    /// Sum of every account's total for `asset`. Exact only while no writer runs.
    pub fn total_supply(&self, asset: &str) -> Amount {
        let cells: Vec<BalanceCell> = self
            .balances
            .iter()
            .filter(|e| e.key().asset == asset)
            .map(|e| Arc::clone(e.value()))
            .collect();
        cells.iter().map(|cell| cell.lock().total).sum()
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        let entries: Vec<(BalanceKey, BalanceCell)> = self
            .balances
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut snapshot = BalanceSnapshot::new();
        for (key, cell) in entries {
            let balance = *cell.lock();
            if balance == Balance::default() {
                continue;
            }
            snapshot
                .entry(key.account)
                .or_default()
                .insert(key.asset, balance);
        }
        snapshot
    }
}
