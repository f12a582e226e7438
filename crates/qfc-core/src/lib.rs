// === Core Ledger Types ===
pub mod block;
pub mod transaction;

// === Admission ===
pub mod error;
pub mod signature;

// === Re-exports for broader ecosystem access ===
pub use block::{Block, PowHasher, ShardId, GENESIS_PREVIOUS_HASH};
pub use error::ValidationError;
pub use signature::{sign_ed25519, Ed25519Verifier, SignatureVerifier};
pub use transaction::{
    units, Amount, Transaction, TxHash, TxSignature, DECIMALS, DEFAULT_ASSET, NETWORK_SENDER,
    UNIT,
};
