// Balance-entry locking for atomic multi-account updates
//
// SAFETY INVARIANTS:
// 1. Entries are locked in ascending BalanceKey order (no lock cycles)
// 2. Work runs on staged copies; entries are written back only on success
// 3. Reservation changes are published before any entry lock is released

use parking_lot::{Mutex, MutexGuard};
use qfc_core::{Amount, TxHash, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One (account, asset) balance entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub account: String,
    pub asset: String,
}

impl BalanceKey {
    pub fn new(account: impl Into<String>, asset: impl Into<String>) -> Self {
        BalanceKey {
            account: account.into(),
            asset: asset.into(),
        }
    }
}

/// Stored balance. `reserved` never exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Amount,
    pub reserved: Amount,
}

impl Balance {
    /// Spendable portion: what every debit path checks against.
    pub fn available(&self) -> Amount {
        self.total.saturating_sub(self.reserved)
    }
}

/// Funds earmarked for a pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub key: BalanceKey,
    pub amount: Amount,
}

pub(crate) type BalanceCell = Arc<Mutex<Balance>>;

/// Working copy of the locked entries plus pending reservation changes.
#[derive(Debug, Default)]
pub struct StagedBalances {
    entries: BTreeMap<BalanceKey, Balance>,
    pub(crate) created: Vec<(TxHash, Reservation)>,
    pub(crate) consumed: Vec<TxHash>,
}

impl StagedBalances {
    pub fn get(&self, key: &BalanceKey) -> Balance {
        self.entries.get(key).copied().unwrap_or_default()
    }

    fn entry(&mut self, key: &BalanceKey) -> &mut Balance {
        self.entries.entry(key.clone()).or_default()
    }

    pub fn credit(&mut self, key: &BalanceKey, amount: Amount) -> Result<(), ValidationError> {
        let entry = self.entry(key);
        entry.total = entry
            .total
            .checked_add(amount)
            .ok_or(ValidationError::Overflow)?;
        Ok(())
    }

    /// Debit unreserved funds.
    pub fn debit_available(&mut self, key: &BalanceKey, amount: Amount) -> Result<(), ValidationError> {
        let entry = self.entry(key);
        if entry.available() < amount {
            return Err(insufficient(key, entry.available(), amount));
        }
        entry.total -= amount;
        Ok(())
    }

    pub fn reserve(&mut self, key: &BalanceKey, amount: Amount) -> Result<(), ValidationError> {
        let entry = self.entry(key);
        if entry.available() < amount {
            return Err(insufficient(key, entry.available(), amount));
        }
        entry.reserved += amount;
        Ok(())
    }

    pub fn unreserve(&mut self, key: &BalanceKey, amount: Amount) {
        let entry = self.entry(key);
        entry.reserved = entry.reserved.saturating_sub(amount);
    }

    /// Debit funds that were reserved earlier; the hold and the balance shrink together.
    pub fn debit_reserved(&mut self, key: &BalanceKey, amount: Amount) -> Result<(), ValidationError> {
        let entry = self.entry(key);
        if entry.reserved < amount || entry.total < amount {
            return Err(insufficient(key, entry.reserved, amount));
        }
        entry.reserved -= amount;
        entry.total -= amount;
        Ok(())
    }

    pub fn is_consumed(&self, id: &TxHash) -> bool {
        self.consumed.contains(id)
    }
}

fn insufficient(key: &BalanceKey, available: Amount, required: Amount) -> ValidationError {
    ValidationError::InsufficientBalance {
        account: key.account.clone(),
        asset: key.asset.clone(),
        available,
        required,
    }
}

/// Lock `cells` (already in ascending key order), run `work` on staged copies,
/// and on success write the entries back and run `publish` before unlocking.
pub(crate) fn with_ordered_locks<R, E>(
    cells: &[(BalanceKey, BalanceCell)],
    work: impl FnOnce(&mut StagedBalances) -> Result<R, E>,
    publish: impl FnOnce(&StagedBalances),
) -> Result<R, E> {
    debug_assert!(cells.windows(2).all(|w| w[0].0 < w[1].0));

    let mut guards: Vec<(&BalanceKey, MutexGuard<'_, Balance>)> =
        cells.iter().map(|(key, cell)| (key, cell.lock())).collect();

    let mut staged = StagedBalances {
        entries: guards.iter().map(|(key, guard)| ((*key).clone(), **guard)).collect(),
        ..StagedBalances::default()
    };

    let result = work(&mut staged)?;

    for (key, guard) in guards.iter_mut() {
        if let Some(updated) = staged.entries.get(*key) {
            **guard = *updated;
        }
    }
    publish(&staged);
    drop(guards);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(total: Amount) -> BalanceCell {
        Arc::new(Mutex::new(Balance { total, reserved: 0 }))
    }

    #[test]
    fn test_failed_work_leaves_entries_untouched() {
        let a = BalanceKey::new("a", "QFC");
        let b = BalanceKey::new("b", "QFC");
        let cells = vec![(a.clone(), cell(10)), (b.clone(), cell(0))];

        let result: Result<(), ValidationError> = with_ordered_locks(
            &cells,
            |staged| {
                staged.credit(&b, 5)?;
                staged.debit_available(&a, 50)
            },
            |_| panic!("publish must not run on failure"),
        );

        assert!(matches!(result, Err(ValidationError::InsufficientBalance { .. })));
        assert_eq!(cells[0].1.lock().total, 10);
        assert_eq!(cells[1].1.lock().total, 0);
    }

    #[test]
    fn test_successful_work_is_written_back() {
        let a = BalanceKey::new("a", "QFC");
        let b = BalanceKey::new("b", "QFC");
        let cells = vec![(a.clone(), cell(10)), (b.clone(), cell(0))];

        with_ordered_locks::<_, ValidationError>(
            &cells,
            |staged| {
                staged.debit_available(&a, 4)?;
                staged.credit(&b, 4)
            },
            |_| {},
        )
        .unwrap();

        assert_eq!(cells[0].1.lock().total, 6);
        assert_eq!(cells[1].1.lock().total, 4);
    }

    #[test]
    fn test_reserved_funds_are_not_available() {
        let a = BalanceKey::new("a", "QFC");
        let mut staged = StagedBalances::default();
        staged.credit(&a, 10).unwrap();
        staged.reserve(&a, 7).unwrap();
        assert_eq!(staged.get(&a).available(), 3);
        assert!(staged.debit_available(&a, 4).is_err());
        staged.debit_reserved(&a, 7).unwrap();
        assert_eq!(staged.get(&a), Balance { total: 3, reserved: 0 });
    }
}
