use crate::transaction::Transaction;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// `previous_hash` of every shard's genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Shard identity, fixed at ledger construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// A block in one shard's chain.
///
/// INVARIANTS:
/// 1. `index` increases by one per block, starting at 0 for genesis
/// 2. `hash` is the PoW hash of the header material, nonce and energy label
/// 3. once mined, `hash` carries `difficulty` leading zero characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub shard_id: ShardId,
    /// Milliseconds since the Unix epoch; 0 for genesis.
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub nonce: u64,
    /// Difficulty the block was mined at.
    pub difficulty: u32,
    /// Declared energy source label; `None` until mined.
    pub energy_source: Option<String>,
    pub hash: String,
}

/// Everything except the seal, in fixed field order. Signatures are included.
#[derive(Serialize)]
struct HeaderView<'a> {
    difficulty: u32,
    index: u64,
    previous_hash: &'a str,
    shard_id: u32,
    timestamp: i64,
    transactions: &'a [Transaction],
}

/// SHA-256 state pre-loaded with a block's header material, so the nonce
/// search only hashes the suffix.
#[derive(Clone)]
pub struct PowHasher {
    base: Sha256,
}

impl PowHasher {
    pub fn new(material: &[u8]) -> Self {
        let mut base = Sha256::new();
        base.update(material);
        PowHasher { base }
    }

    pub fn hash(&self, nonce: u64, energy_source: &str) -> String {
        let mut hasher = self.base.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(energy_source.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Block {
    /// Genesis block of a shard: deterministic, so every node derives the same tip.
    pub fn genesis(shard_id: ShardId) -> Self {
        let mut block = Block {
            index: 0,
            shard_id,
            timestamp: 0,
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            nonce: 0,
            difficulty: 0,
            energy_source: None,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Unmined candidate extending `previous_hash`.
    pub fn candidate(
        shard_id: ShardId,
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
    ) -> Self {
        let mut block = Block {
            index,
            shard_id,
            timestamp: Utc::now().timestamp_millis(),
            transactions,
            previous_hash,
            nonce: 0,
            difficulty: 0,
            energy_source: None,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Serialized block without its seal, as it would be mined at `difficulty`.
    pub fn header_material_at(&self, difficulty: u32) -> Vec<u8> {
        let view = HeaderView {
            difficulty,
            index: self.index,
            previous_hash: &self.previous_hash,
            shard_id: self.shard_id.0,
            timestamp: self.timestamp,
            transactions: &self.transactions,
        };
        serde_json::to_vec(&view).unwrap_or_default()
    }

    pub fn header_material(&self) -> Vec<u8> {
        self.header_material_at(self.difficulty)
    }

    /// Recompute the hash from the block's own fields.
    pub fn compute_hash(&self) -> String {
        PowHasher::new(&self.header_material())
            .hash(self.nonce, self.energy_source.as_deref().unwrap_or(""))
    }

    /// Attach a found seal.
    pub fn sealed(mut self, nonce: u64, difficulty: u32, energy_source: String, hash: String) -> Self {
        self.nonce = nonce;
        self.difficulty = difficulty;
        self.energy_source = Some(energy_source);
        self.hash = hash;
        self
    }

    /// True when `hash` starts with `difficulty` zero characters.
    pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
        let difficulty = difficulty as usize;
        hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
    }
}
