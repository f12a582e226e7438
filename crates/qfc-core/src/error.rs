use crate::transaction::Amount;
use thiserror::Error;

/// Rejections raised synchronously at the admission boundary.
///
/// A transaction or order that fails with one of these never enters a
/// pending queue, an order book, or a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("amount must be greater than zero")]
    NonPositiveAmount,

    #[error("account identifier must not be empty")]
    EmptyAccount,

    #[error("asset tag must not be empty")]
    EmptyAsset,

    #[error("sender and recipient are the same account ({0})")]
    SelfTransfer(String),

    #[error("account {0} is reserved for ledger bookkeeping")]
    ReservedAccount(String),

    #[error("insufficient {asset} balance for {account}: available {available}, required {required}")]
    InsufficientBalance {
        account: String,
        asset: String,
        available: Amount,
        required: Amount,
    },

    #[error("transaction {0} was already admitted")]
    DuplicateTransaction(String),

    #[error("transaction is not signed")]
    MissingSignature,

    #[error("signature check failed for transaction {0}")]
    InvalidSignature(String),

    #[error("malformed order: {0}")]
    MalformedOrder(String),

    #[error("balance arithmetic overflow")]
    Overflow,
}
