//! Exchange: one limit order book per asset, priced in a single quote asset.
//!
//! Matching is price-time priority at the midpoint of the crossing prices.
//! Settlement is delegated through [`TradeSettlement`], so the book never
//! touches balances itself.

pub mod engine;
pub mod order;
pub mod order_book;

pub use engine::{ExchangeEngine, ExchangeError, SettlementError, TradeSettlement};
pub use order::{Order, OrderRequest, Side, Trade};
pub use order_book::{BookSnapshot, OrderBook};
