pub mod carbon;
pub mod config;
pub mod difficulty;
pub mod engine;
pub mod pow_engine;

pub use carbon::{CarbonCreditLedger, CarbonCreditMarket, CarbonError, MarketQuote};
pub use config::ConsensusConfig;
pub use difficulty::{DifficultyController, DifficultySnapshot};
pub use engine::{reward_origin, ConsensusEngine, ConsensusError, MinedSeal, MiningState};
pub use pow_engine::{solve, EnergySource};
