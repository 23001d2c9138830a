//! Application service: input validation, deadlines and logging around the
//! ledger engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, instrument, warn};

use purse_core::{
    Balance, Currency, DomainError, DomainResult, Operation, OrderId, OrderKey, ServiceId, UserId,
};
use purse_infra::store::{LedgerStore, OperationQuery};
use purse_infra::Ledger;

/// Store handle shared by every request.
pub type SharedStore = Arc<dyn LedgerStore>;

/// Entry point for the HTTP handlers.
///
/// Holds only the engine and the per-call deadline; it can be cloned into an
/// `Arc` and shared across request tasks.
pub struct BalanceService {
    ledger: Ledger<SharedStore>,
    deadline: Duration,
}

impl BalanceService {
    pub fn new(store: SharedStore, deadline: Duration) -> Self {
        Self {
            ledger: Ledger::new(store),
            deadline,
        }
    }

    #[instrument(skip(self, service_id), fields(user_id = %user_id))]
    pub async fn credit(
        &self,
        user_id: &str,
        service_id: Option<&str>,
        amount: i64,
    ) -> DomainResult<Operation> {
        let user_id = UserId::parse(user_id)?;
        let service_id = match service_id.map(str::trim) {
            Some(s) if !s.is_empty() => Some(ServiceId::parse(s)?),
            _ => None,
        };
        let amount = positive(amount)?;

        self.run(self.ledger.credit(&user_id, amount, service_id)).await
    }

    #[instrument(skip(self), fields(user_id = %user_id, service_id = %service_id, order_id = %order_id))]
    pub async fn reserve(
        &self,
        user_id: &str,
        service_id: &str,
        order_id: &str,
        amount: i64,
    ) -> DomainResult<Operation> {
        let (key, amount) = order(user_id, service_id, order_id, amount)?;
        self.run(self.ledger.reserve(key, amount)).await
    }

    #[instrument(skip(self), fields(user_id = %user_id, service_id = %service_id, order_id = %order_id))]
    pub async fn commit(
        &self,
        user_id: &str,
        service_id: &str,
        order_id: &str,
        amount: i64,
    ) -> DomainResult<Operation> {
        let (key, amount) = order(user_id, service_id, order_id, amount)?;
        self.run(self.ledger.commit(key, amount)).await
    }

    #[instrument(skip(self), fields(user_id = %user_id, service_id = %service_id, order_id = %order_id))]
    pub async fn rollback(
        &self,
        user_id: &str,
        service_id: &str,
        order_id: &str,
        amount: i64,
    ) -> DomainResult<Operation> {
        let (key, amount) = order(user_id, service_id, order_id, amount)?;
        self.run(self.ledger.rollback(key, amount)).await
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn balance(&self, user_id: &str) -> DomainResult<Balance> {
        let user_id = UserId::parse(user_id)?;
        self.run(self.ledger.balance(&user_id)).await
    }

    #[instrument(skip(self, query), fields(user_id = %user_id))]
    pub async fn operations(
        &self,
        user_id: &str,
        query: OperationQuery,
    ) -> DomainResult<Vec<Operation>> {
        let user_id = UserId::parse(user_id)?;
        self.run(self.ledger.operations(&user_id, &query)).await
    }

    /// Await `call` under the deadline. An elapsed deadline drops the call,
    /// which drops (and so rolls back) any open storage transaction.
    async fn run<T, F>(&self, call: F) -> DomainResult<T>
    where
        F: Future<Output = DomainResult<T>>,
    {
        let result = match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::internal(format!(
                "deadline of {}ms exceeded",
                self.deadline.as_millis()
            ))),
        };

        if let Err(err) = &result {
            if err.is_business() {
                warn!(code = err.code(), error = %err, "request rejected");
            } else {
                error!(error = %err, "request failed");
            }
        }
        result
    }
}

fn positive(amount: i64) -> DomainResult<Currency> {
    let amount = Currency::new(amount);
    if amount.is_positive() {
        Ok(amount)
    } else {
        Err(DomainError::invalid_param(format!("currency must be positive, got {amount}")))
    }
}

fn order(
    user_id: &str,
    service_id: &str,
    order_id: &str,
    amount: i64,
) -> DomainResult<(OrderKey, Currency)> {
    let key = OrderKey::new(
        UserId::parse(user_id)?,
        ServiceId::parse(service_id)?,
        OrderId::parse(order_id)?,
    );
    Ok((key, positive(amount)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use purse_infra::store::{InMemoryLedgerStore, StoreTransaction};

    fn service() -> BalanceService {
        BalanceService::new(Arc::new(InMemoryLedgerStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn validation_happens_before_storage() {
        let svc = service();
        assert!(matches!(
            svc.credit("", None, 10).await,
            Err(DomainError::InvalidParam(_))
        ));
        assert!(matches!(
            svc.credit("u1", None, 0).await,
            Err(DomainError::InvalidParam(_))
        ));
        assert!(matches!(
            svc.reserve("u1", "", "o1", 10).await,
            Err(DomainError::InvalidParam(_))
        ));
        assert!(matches!(
            svc.commit("u1", "shop", " ", 10).await,
            Err(DomainError::InvalidParam(_))
        ));
        assert!(matches!(svc.balance("u1").await, Err(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn blank_credit_service_uses_default() {
        let svc = service();
        let op = svc.credit("u1", Some("  "), 10).await.unwrap();
        assert_eq!(op.service_id().as_str(), ServiceId::DEFAULT_CREDIT);
        assert_eq!(svc.balance("u1").await.unwrap().amount(), Currency::new(10));
    }

    #[tokio::test]
    async fn elapsed_deadline_is_internal_and_rolls_back() {
        let store = InMemoryLedgerStore::new();
        let svc = BalanceService::new(Arc::new(store.clone()), Duration::from_millis(20));
        svc.credit("u1", None, 50).await.unwrap();

        // Keep the user's account locked so the reserve cannot finish in time.
        let user = UserId::parse("u1").unwrap();
        let mut blocker = store.begin().await.unwrap();
        blocker.deposit(&user, Currency::new(1)).await.unwrap();

        let err = svc.reserve("u1", "shop", "o1", 10).await.unwrap_err();
        assert!(matches!(err, DomainError::Internal(_)));
        drop(blocker);

        assert_eq!(svc.balance("u1").await.unwrap().amount(), Currency::new(50));
    }
}
