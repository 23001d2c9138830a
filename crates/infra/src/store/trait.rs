use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use purse_core::{
    Balance, Currency, DomainError, NewOperation, Operation, OperationId, OperationStatus,
    OrderKey, UserId,
};

use super::query::OperationQuery;

/// Ledger store operation error.
///
/// These are **storage-level** outcomes: integrity-constraint violations
/// reported by the backend, plus opaque backend failures. The ledger engine
/// converts them into `DomainError` so no driver error reaches a caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row the statement targeted does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The balance non-negativity constraint rejected the write.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Any other value constraint rejected the write (e.g. outstanding reserve < 0).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Connection, driver or decoding failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => DomainError::NotFound(what),
            StoreError::Duplicate(_) => DomainError::DuplicateReservation,
            StoreError::InsufficientFunds(_) => DomainError::InsufficientFunds,
            StoreError::InvalidValue(msg) => DomainError::InvalidCommitValue(msg),
            StoreError::Storage(msg) => DomainError::Internal(msg),
        }
    }
}

/// Durable home of balances and operations.
///
/// Writes only happen through a [`StoreTransaction`] obtained from
/// [`LedgerStore::begin`]; reads are served directly and never observe a
/// transaction that has not committed.
///
/// Implementations must:
/// - serialize transactions that touch the same user
/// - apply every write of a transaction atomically on `commit`, or none of them
/// - roll back when a transaction handle is dropped without `commit`
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a storage transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Current balance of a user, `None` if the user was never credited.
    async fn balance(&self, user_id: &UserId) -> Result<Option<Balance>, StoreError>;

    /// Page of a user's operations in the requested order.
    async fn operations(
        &self,
        user_id: &UserId,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, StoreError>;
}

/// A unit of work against a [`LedgerStore`].
///
/// Balance changes are relative deltas; the store (not the caller) enforces
/// `amount >= 0` so concurrent transactions can never overdraw.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Add `amount` to the user's balance, creating the balance if needed.
    async fn deposit(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError>;

    /// Subtract `amount` from an existing balance.
    ///
    /// `NotFound` if the user has no balance, `InsufficientFunds` if the result
    /// would be negative.
    async fn withdraw(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError>;

    /// Record a new operation. `Duplicate` if its order key is taken.
    ///
    /// Adapters may refuse with `NotFound` when the user has no balance yet.
    async fn insert_operation(&mut self, draft: NewOperation) -> Result<Operation, StoreError>;

    /// Find an operation by order key and lock it until the transaction ends.
    async fn lock_operation(&mut self, key: &OrderKey) -> Result<Option<Operation>, StoreError>;

    /// Release `amount` from the operation's outstanding reserve and move it to `status`.
    ///
    /// `InvalidValue` if more than the outstanding reserve is released.
    async fn settle_operation(
        &mut self,
        id: OperationId,
        amount: Currency,
        status: OperationStatus,
    ) -> Result<Operation, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        (**self).begin().await
    }

    async fn balance(&self, user_id: &UserId) -> Result<Option<Balance>, StoreError> {
        (**self).balance(user_id).await
    }

    async fn operations(
        &self,
        user_id: &UserId,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, StoreError> {
        (**self).operations(user_id, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_the_domain_taxonomy() {
        assert_eq!(
            DomainError::from(StoreError::NotFound("balance".into())),
            DomainError::not_found("balance")
        );
        assert_eq!(
            DomainError::from(StoreError::Duplicate("order".into())),
            DomainError::DuplicateReservation
        );
        assert_eq!(
            DomainError::from(StoreError::InsufficientFunds("x".into())),
            DomainError::InsufficientFunds
        );
        assert!(matches!(
            DomainError::from(StoreError::InvalidValue("x".into())),
            DomainError::InvalidCommitValue(_)
        ));
        assert!(matches!(
            DomainError::from(StoreError::Storage("conn reset".into())),
            DomainError::Internal(_)
        ));
    }
}
