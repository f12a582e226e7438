// Per-shard green proof-of-work engine
//
// SAFETY: This engine enforces the following contract:
// 1. Mining never holds a shard or ledger lock (it owns only the candidate)
// 2. Verification recomputes everything from the block itself
// 3. At most one search runs per shard at a time
// 4. Issuance in a block is limited to well-formed mining rewards

use crate::carbon::{CarbonCreditLedger, CarbonError};
use crate::config::ConsensusConfig;
use crate::difficulty::{DifficultyController, DifficultySnapshot};
use crate::pow_engine::{solve, EnergySource};
use log::{info, warn};
use parking_lot::Mutex;
use qfc_core::{Amount, Block, ShardId, Transaction, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const REWARD_INDEX_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Shard and block index a mining reward pays for, unpacked from its nonce.
pub fn reward_origin(tx: &Transaction) -> (ShardId, u64) {
    (ShardId((tx.nonce() >> 48) as u32), tx.nonce() & REWARD_INDEX_MASK)
}

/// Consensus errors with enough context to act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// Stored hash differs from the recomputed one (tampering or corruption)
    #[error("Invalid block hash at height {block_height}: {reason}")]
    InvalidBlockHash { block_height: u64, reason: String },

    #[error("Insufficient proof of work: {reason}")]
    InsufficientProofOfWork { reason: String },

    #[error("Block difficulty {got} below the accepted minimum {required}")]
    DifficultyTooLow { required: u32, got: u32 },

    #[error("Block at height {block_height} declares no energy source")]
    MissingEnergySource { block_height: u64 },

    #[error("Energy source {0:?} is not renewable")]
    UnknownEnergySource(String),

    /// Nonce search hit the configured bound
    #[error("No proof of work within {attempts} attempts at difficulty {difficulty}")]
    IterationCapExceeded { attempts: u64, difficulty: u32 },

    #[error("{0} is already mining")]
    MiningInProgress(ShardId),

    #[error("Invalid issuance: {reason}")]
    InvalidIssuance { reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Carbon(#[from] CarbonError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiningState {
    Idle,
    Mining,
    Success,
    Aborted,
}

/// A found proof-of-work, ready to attach to its candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedSeal {
    pub nonce: u64,
    pub hash: String,
    pub energy_source: EnergySource,
    pub difficulty: u32,
}

impl MinedSeal {
    pub fn apply(&self, candidate: Block) -> Block {
        candidate.sealed(
            self.nonce,
            self.difficulty,
            self.energy_source.label().to_string(),
            self.hash.clone(),
        )
    }
}

pub struct ConsensusEngine {
    shard: ShardId,
    config: ConsensusConfig,
    difficulty: Mutex<DifficultyController>,
    state: Mutex<MiningState>,
    carbon: Arc<CarbonCreditLedger>,
}

impl ConsensusEngine {
    pub fn new(shard: ShardId, config: ConsensusConfig, carbon: Arc<CarbonCreditLedger>) -> Self {
        let difficulty = DifficultyController::new(
            config.initial_difficulty,
            config.target_block_time_ms,
            config.adjustment_interval,
        );
        ConsensusEngine {
            shard,
            config,
            difficulty: Mutex::new(difficulty),
            state: Mutex::new(MiningState::Idle),
            carbon,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty.lock().current()
    }

    pub fn difficulty_snapshot(&self) -> DifficultySnapshot {
        self.difficulty.lock().snapshot()
    }

    pub fn state(&self) -> MiningState {
        *self.state.lock()
    }

    /// Search for a seal on `candidate` at the current difficulty.
    ///
    /// The energy source is drawn uniformly from the renewable set. The
    /// search duration feeds the retarget window.
    pub fn mine(&self, candidate: &Block, miner: &str) -> Result<MinedSeal, ConsensusError> {
        {
            let mut state = self.state.lock();
            if *state == MiningState::Mining {
                return Err(ConsensusError::MiningInProgress(self.shard));
            }
            *state = MiningState::Mining;
        }

        let difficulty = self.difficulty();
        let source = EnergySource::random(&mut rand::thread_rng());
        let material = candidate.header_material_at(difficulty);
        let started = Instant::now();

        match solve(&material, difficulty, source, self.config.max_iterations) {
            Ok((nonce, hash)) => {
                *self.state.lock() = MiningState::Success;
                self.record_block_time(started.elapsed().as_millis() as u64);
                info!(
                    "[{}] {} mined block #{} on {} (difficulty {})",
                    self.shard, miner, candidate.index, source, difficulty
                );
                Ok(MinedSeal {
                    nonce,
                    hash,
                    energy_source: source,
                    difficulty,
                })
            }
            Err(err) => {
                *self.state.lock() = MiningState::Aborted;
                warn!("[{}] Mining aborted for {}: {}", self.shard, miner, err);
                Err(err)
            }
        }
    }

    /// Feed one block duration into the retarget window.
    pub fn record_block_time(&self, duration_ms: u64) -> Option<u32> {
        self.difficulty.lock().record(duration_ms)
    }

    pub fn verify(&self, block: &Block) -> bool {
        self.verify_block(block).is_ok()
    }

    /// Recompute the hash and check prefix, difficulty floor and energy label.
    pub fn verify_block(&self, block: &Block) -> Result<(), ConsensusError> {
        if block.is_genesis() && *block == Block::genesis(block.shard_id) {
            return Ok(());
        }

        let label = block
            .energy_source
            .as_deref()
            .ok_or(ConsensusError::MissingEnergySource {
                block_height: block.index,
            })?;
        label.parse::<EnergySource>()?;

        let floor = self.difficulty.lock().accepted_floor();
        if block.difficulty < floor {
            return Err(ConsensusError::DifficultyTooLow {
                required: floor,
                got: block.difficulty,
            });
        }

        let recomputed = block.compute_hash();
        if recomputed != block.hash {
            return Err(ConsensusError::InvalidBlockHash {
                block_height: block.index,
                reason: format!("stored {} but recomputed {}", block.hash, recomputed),
            });
        }

        if !Block::meets_difficulty(&block.hash, block.difficulty) {
            return Err(ConsensusError::InsufficientProofOfWork {
                reason: format!(
                    "need {} leading zeros, got {}",
                    block.difficulty,
                    block.hash.chars().take_while(|c| *c == '0').count()
                ),
            });
        }

        Ok(())
    }

    /// Reject issuance other than a configured mining reward.
    ///
    /// Each reward names a mined block through its nonce, so a block may not
    /// carry two rewards for the same origin or one for a genesis block.
    pub fn validate_issuance(&self, block: &Block) -> Result<(), ConsensusError> {
        let mut origins = HashSet::new();
        for tx in block.transactions.iter().filter(|tx| tx.is_issuance()) {
            let (source, index) = reward_origin(tx);
            if index == 0 {
                return Err(ConsensusError::InvalidIssuance {
                    reason: format!("reward for the genesis block of {}", source),
                });
            }
            if !origins.insert(tx.nonce()) {
                return Err(ConsensusError::InvalidIssuance {
                    reason: format!("second reward for {} block #{}", source, index),
                });
            }
            if tx.asset() != self.config.reward_asset || tx.amount() != self.config.reward_amount {
                return Err(ConsensusError::InvalidIssuance {
                    reason: format!(
                        "{} {} to {} is not a mining reward",
                        tx.amount(),
                        tx.asset(),
                        tx.recipient()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Reward transaction for the miner of block `index` on this shard.
    ///
    /// The nonce packs (shard, index) so two rewards never share a hash.
    pub fn reward_transaction(&self, miner: &str, index: u64) -> Result<Transaction, ConsensusError> {
        let nonce = (u64::from(self.shard.0) << 48) | (index & REWARD_INDEX_MASK);
        Ok(Transaction::issuance(
            miner,
            self.config.reward_amount,
            self.config.reward_asset.clone(),
            nonce,
        )?)
    }

    /// Credit the miner's carbon balance for a block mined on `source`.
    pub fn award_carbon(&self, miner: &str, source: EnergySource) -> Result<Amount, ConsensusError> {
        Ok(self.carbon.award(miner, source)?)
    }
}
