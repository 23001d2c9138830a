//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// This is the fixed taxonomy reported to callers of the ledger. Storage
/// failures are translated into one of these kinds before they leave the
/// storage boundary; the original cause of an `Internal` error is never shown
/// to API clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or missing input (empty identifier, non-positive amount, ...).
    #[error("invalid param: {0}")]
    InvalidParam(String),

    /// The balance or operation does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A reservation for the same order, service and user already exists.
    #[error("order already exists")]
    DuplicateReservation,

    /// The reservation would drive the balance negative.
    #[error("reserve invalid value: insufficient funds")]
    InsufficientFunds,

    /// The settlement request does not match the reservation (wrong amount,
    /// or the reservation is no longer in the reserved state).
    #[error("commit invalid value: {0}")]
    InvalidCommitValue(String),

    /// Storage or transport failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::InvalidCommitValue(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParam(_) => "invalid_param",
            Self::NotFound(_) => "not_found",
            Self::DuplicateReservation => "duplicate_reservation",
            Self::InsufficientFunds => "insufficient_funds",
            Self::InvalidCommitValue(_) => "invalid_commit_value",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error is a caller/business failure rather than a fault of
    /// the service itself.
    pub fn is_business(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}
