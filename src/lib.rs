//! QuantumFuse: a sharded account ledger with green proof-of-work,
//! cross-shard two-phase commit and an on-ledger exchange.
//!
//! [`ShardedLedger`] is the entry point. It owns the shared asset ledger,
//! one chain and consensus engine per shard, the cross-shard coordinator,
//! the exchange and the carbon credit market.

pub mod config;
pub mod error;
pub mod ledger;
pub mod message;
pub mod onramp;
pub mod settlement;
pub mod snapshot;

pub use config::{ConfigError, LedgerConfig};
pub use error::LedgerError;
pub use ledger::{ShardedLedger, SubmitOutcome};
pub use message::{InboundMessage, OutboundMessage};
pub use onramp::{OnRamp, PaymentProcessor, Purchase};
pub use snapshot::{LedgerSnapshot, ShardSnapshot};

