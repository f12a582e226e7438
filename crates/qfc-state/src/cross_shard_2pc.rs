// Cross-shard two-phase commit over {source, destination}
//
// SAFETY INVARIANTS:
// 1. Initiated -> Prepared -> Committed, or Initiated/Prepared -> Aborted
// 2. Prepare holds the sender's funds; nothing else can spend them
// 3. Commit debits the source and credits the destination atomically
// 4. Once the source is debited the transfer is retryable, not cancellable;
//    only an explicit compensation refunds the sender
// 5. Commit on Committed and abort on Aborted are no-ops

use crate::asset_ledger::{AssetLedger, ESCROW_ACCOUNT};
use crate::cross_shard_recovery::RetryPolicy;
use crate::error::CoordinatorError;
use crate::shard::Shard;
use crate::sharding::ShardRouter;
use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use qfc_core::{ShardId, Transaction, TxHash, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Initiated,
    Prepared,
    Committed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Committed | TransferState::Aborted)
    }
}

/// A transfer whose sender and recipient live on different shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossShardTransfer {
    pub id: TxHash,
    pub transaction: Transaction,
    pub source: ShardId,
    pub destination: ShardId,
    pub state: TransferState,
    /// Source leg already debited into escrow; destination still owed.
    pub source_committed: bool,
    pub attempts: u32,
}

pub struct CrossShardCoordinator {
    ledger: Arc<AssetLedger>,
    shards: Vec<Arc<Shard>>,
    router: ShardRouter,
    retry: RetryPolicy,
    active: DashMap<TxHash, Arc<Mutex<CrossShardTransfer>>>,
    settled: DashMap<TxHash, TransferState>,
}

impl CrossShardCoordinator {
    pub fn new(
        ledger: Arc<AssetLedger>,
        shards: Vec<Arc<Shard>>,
        router: ShardRouter,
        retry: RetryPolicy,
    ) -> Self {
        CrossShardCoordinator {
            ledger,
            shards,
            router,
            retry,
            active: DashMap::new(),
            settled: DashMap::new(),
        }
    }

    fn handle(&self, id: &TxHash) -> Result<Arc<Mutex<CrossShardTransfer>>, CoordinatorError> {
        self.active
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoordinatorError::UnknownTransfer(id.as_hex()))
    }

    fn settle(&self, transfer: &CrossShardTransfer) {
        self.settled.insert(transfer.id, transfer.state);
        self.active.remove(&transfer.id);
    }

    fn destination_reachable(&self, shard: ShardId) -> bool {
        self.shards
            .get(shard.index())
            .map(|s| s.is_reachable())
            .unwrap_or(false)
    }

    /// Register a cross-shard transfer in the Initiated state.
    pub fn initiate(&self, tx: Transaction) -> Result<TxHash, CoordinatorError> {
        tx.validate()?;
        let id = tx.hash();
        let (source, destination) = self.router.endpoints(&tx);
        if source == destination {
            return Err(CoordinatorError::NotCrossShard(id.as_hex()));
        }
        if self.settled.contains_key(&id) {
            return Err(ValidationError::DuplicateTransaction(id.as_hex()).into());
        }

        let transfer = CrossShardTransfer {
            id,
            transaction: tx,
            source,
            destination,
            state: TransferState::Initiated,
            source_committed: false,
            attempts: 0,
        };
        match self.active.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ValidationError::DuplicateTransaction(id.as_hex()).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(transfer)));
            }
        }

        info!("Initiated cross-shard transfer {} ({} -> {})", id.short(), source, destination);
        Ok(id)
    }

    /// Reserve the sender's funds. An insufficient balance aborts the transfer.
    pub fn prepare(&self, id: &TxHash) -> Result<TransferState, CoordinatorError> {
        let handle = self.handle(id)?;
        let mut transfer = handle.lock();

        match transfer.state {
            TransferState::Prepared => return Ok(TransferState::Prepared),
            TransferState::Initiated => {}
            from => {
                return Err(CoordinatorError::InvalidTransition {
                    id: id.as_hex(),
                    from,
                    to: TransferState::Prepared,
                })
            }
        }

        let tx = &transfer.transaction;
        if let Err(err) = self.ledger.reserve(*id, tx.sender(), tx.asset(), tx.amount()) {
            warn!("Prepare failed for {}: {}", id.short(), err);
            transfer.state = TransferState::Aborted;
            self.settle(&transfer);
            return Err(err.into());
        }

        transfer.state = TransferState::Prepared;
        info!("Prepared cross-shard transfer {}", id.short());
        Ok(TransferState::Prepared)
    }

    /// Apply both legs. An unreachable destination parks the debited funds
    /// in escrow and reports a timeout; the transfer stays Prepared.
    pub fn commit(&self, id: &TxHash) -> Result<TransferState, CoordinatorError> {
        if let Some(state) = self.settled.get(id).map(|s| *s) {
            return match state {
                TransferState::Committed => Ok(TransferState::Committed),
                from => Err(CoordinatorError::InvalidTransition {
                    id: id.as_hex(),
                    from,
                    to: TransferState::Committed,
                }),
            };
        }

        let handle = self.handle(id)?;
        let mut transfer = handle.lock();

        match transfer.state {
            TransferState::Committed => return Ok(TransferState::Committed),
            TransferState::Prepared => {}
            from => {
                return Err(CoordinatorError::InvalidTransition {
                    id: id.as_hex(),
                    from,
                    to: TransferState::Committed,
                })
            }
        }

        transfer.attempts += 1;
        let recipient = transfer.transaction.recipient().to_string();

        if !self.destination_reachable(transfer.destination) {
            if !transfer.source_committed {
                self.ledger.commit_reserved(id, ESCROW_ACCOUNT)?;
                transfer.source_committed = true;
                warn!(
                    "Destination {} unreachable; {} held in escrow",
                    transfer.destination,
                    id.short()
                );
            }
            return Err(CoordinatorError::Timeout {
                id: id.as_hex(),
                shard: transfer.destination,
            });
        }

        if transfer.source_committed {
            let tx = &transfer.transaction;
            self.ledger
                .transfer(ESCROW_ACCOUNT, &recipient, tx.asset(), tx.amount())?;
        } else {
            self.ledger.commit_reserved(id, &recipient)?;
        }

        transfer.state = TransferState::Committed;
        transfer.source_committed = false;
        self.settle(&transfer);
        info!(
            "Committed cross-shard transfer {} after {} attempt(s)",
            id.short(),
            transfer.attempts
        );
        Ok(TransferState::Committed)
    }

    /// Release the reservation. Refused once the source has been debited.
    pub fn abort(&self, id: &TxHash) -> Result<TransferState, CoordinatorError> {
        if let Some(state) = self.settled.get(id).map(|s| *s) {
            return match state {
                TransferState::Aborted => Ok(TransferState::Aborted),
                from => Err(CoordinatorError::InvalidTransition {
                    id: id.as_hex(),
                    from,
                    to: TransferState::Aborted,
                }),
            };
        }

        let handle = self.handle(id)?;
        let mut transfer = handle.lock();

        if transfer.state == TransferState::Aborted {
            return Ok(TransferState::Aborted);
        }
        if transfer.state == TransferState::Committed || transfer.source_committed {
            return Err(CoordinatorError::InvalidTransition {
                id: id.as_hex(),
                from: transfer.state,
                to: TransferState::Aborted,
            });
        }

        self.ledger.release(id)?;
        transfer.state = TransferState::Aborted;
        self.settle(&transfer);
        info!("Aborted cross-shard transfer {}", id.short());
        Ok(TransferState::Aborted)
    }

    /// Operator action: refund escrowed funds to the sender and abort.
    pub fn compensate(&self, id: &TxHash) -> Result<TransferState, CoordinatorError> {
        let handle = self.handle(id)?;
        let mut transfer = handle.lock();

        if !transfer.source_committed {
            drop(transfer);
            return self.abort(id);
        }

        let tx = &transfer.transaction;
        self.ledger
            .transfer(ESCROW_ACCOUNT, tx.sender(), tx.asset(), tx.amount())?;
        error!(
            "Compensated cross-shard transfer {}: refunded {} {} to {} after {} attempts",
            id.short(),
            tx.amount(),
            tx.asset(),
            tx.sender(),
            transfer.attempts
        );

        transfer.state = TransferState::Aborted;
        transfer.source_committed = false;
        self.settle(&transfer);
        Ok(TransferState::Aborted)
    }

    /// Drive a transfer from initiation to a settled state, retrying timeouts
    /// with exponential backoff.
    pub fn execute(&self, tx: Transaction) -> Result<TransferState, CoordinatorError> {
        let id = self.initiate(tx)?;
        self.prepare(&id)?;
        self.commit_with_retry(&id)
    }

    /// Commit a Prepared transfer, retrying timeouts with the policy's backoff.
    pub fn commit_with_retry(&self, id: &TxHash) -> Result<TransferState, CoordinatorError> {
        let mut delays = self.retry.backoff();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.commit(id) {
                Err(CoordinatorError::Timeout { shard, .. }) => {
                    if self.retry.should_give_up(attempts) {
                        error!(
                            "Transfer {} to {} unsettled after {} attempts; funds held in escrow",
                            id.short(),
                            shard,
                            attempts
                        );
                        return Err(CoordinatorError::RetriesExhausted {
                            id: id.as_hex(),
                            attempts,
                        });
                    }
                    if let Some(delay) = delays.next() {
                        std::thread::sleep(delay);
                    }
                }
                other => return other,
            }
        }
    }

    /// One more commit attempt for every transfer whose source leg already landed.
    pub fn retry_pending(&self) -> Vec<(TxHash, Result<TransferState, CoordinatorError>)> {
        let handles: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        let waiting: Vec<TxHash> = handles
            .iter()
            .filter_map(|h| {
                let transfer = h.lock();
                transfer.source_committed.then_some(transfer.id)
            })
            .collect();

        waiting
            .into_iter()
            .map(|id| (id, self.commit(&id)))
            .collect()
    }

    /// Current state of a transfer, settled or not.
    pub fn outcome(&self, id: &TxHash) -> Option<TransferState> {
        if let Some(state) = self.settled.get(id) {
            return Some(*state);
        }
        let handle = self.active.get(id).map(|entry| entry.value().clone())?;
        let state = handle.lock().state;
        Some(state)
    }

    pub fn transfer(&self, id: &TxHash) -> Option<CrossShardTransfer> {
        let handle = self.active.get(id).map(|entry| entry.value().clone())?;
        let transfer = handle.lock().clone();
        Some(transfer)
    }

    /// Transfers not yet Committed or Aborted.
    pub fn in_flight(&self) -> Vec<CrossShardTransfer> {
        let handles: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        handles.iter().map(|h| h.lock().clone()).collect()
    }

    pub fn settled(&self) -> Vec<(TxHash, TransferState)> {
        self.settled.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}
