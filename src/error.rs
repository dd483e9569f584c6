// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::domain::Side;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Failures of the account store contract.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A mutation that would break an account invariant (overdraw,
    /// occupied pending slot). Handlers guard before mutating, so hitting
    /// this means a caller skipped its precondition check.
    #[error("store conflict: {0}")]
    Conflict(&'static str),

    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything a command handler can fail with. All variants are recovered
/// at the engine boundary into a `"-1"` response plus one SystemError
/// audit event; nothing propagates past the engine.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not enough funds")]
    InsufficientFunds,

    #[error("not enough shares")]
    InsufficientShares,

    #[error("no pending {0} order")]
    NoPendingOrder(Side),

    #[error("{0} order already pending")]
    OrderPending(Side),

    #[error("pending {0} order expired")]
    OrderExpired(Side),

    #[error("no active trigger for this user and stock")]
    NoActiveTrigger,

    #[error("trigger amount already set for this user and stock")]
    DuplicateTrigger,

    #[error("quote source unavailable: {0}")]
    ExternalUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
