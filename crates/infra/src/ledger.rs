//! Ledger engine: the balance/operation state machine.
//!
//! Every mutating call runs as exactly one storage transaction:
//!
//! ```text
//! credit    deposit(+amount)            + insert Credit (committed)
//! reserve   insert Debit (reserved)     + withdraw(amount)
//! commit    lock Debit → check          + settle(committed)
//! rollback  lock Debit → check          + settle(rolled_back) + deposit(+amount)
//! ```
//!
//! ## Rules
//!
//! - Amounts must be strictly positive.
//! - Balance changes are relative deltas applied by the store, never a
//!   read-modify-write in engine memory, so the store's `amount >= 0`
//!   constraint decides whether concurrent reservations fit.
//! - A reservation is inserted *before* the balance is touched. A retried
//!   reserve therefore reports `DuplicateReservation` even if the balance has
//!   since dropped.
//! - Commit and rollback only apply to a `Reserved` debit and only for exactly
//!   the reserved amount. Anything else is `InvalidCommitValue`.
//! - Any failure drops (or explicitly rolls back) the transaction; no partial
//!   effect survives.
//!
//! The engine holds no locks of its own; same-user serialization is the
//! store's job.

use tracing::{debug, instrument, warn};

use purse_core::{
    Balance, Currency, DomainError, DomainResult, Entity, NewOperation, Operation,
    OperationStatus, OperationType, OrderId, OrderKey, ServiceId, UserId,
};

use crate::store::{LedgerStore, OperationQuery, StoreTransaction};

/// Balance ledger over any [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct Ledger<S> {
    store: S,
}

impl<S> Ledger<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Add funds to a user's balance, creating it on first credit.
    ///
    /// Recorded as a committed Credit operation under `service_id` (default
    /// `"credit"`) with a freshly generated order id.
    #[instrument(skip(self, service_id), fields(user_id = %user_id, amount = %amount), err)]
    pub async fn credit(
        &self,
        user_id: &UserId,
        amount: Currency,
        service_id: Option<ServiceId>,
    ) -> DomainResult<Operation> {
        ensure_positive(amount)?;

        let mut tx = self.store.begin().await?;
        let balance = tx.deposit(user_id, amount).await?;
        let operation = tx
            .insert_operation(NewOperation::credit(
                user_id.clone(),
                service_id.unwrap_or_else(ServiceId::default_credit),
                OrderId::generate(),
                amount,
            ))
            .await?;
        tx.commit().await?;

        debug!(balance = %balance.amount(), "credited");
        Ok(operation)
    }

    /// Put `amount` on hold for an order.
    #[instrument(
        skip(self, key),
        fields(
            user_id = %key.user_id,
            service_id = %key.service_id,
            order_id = %key.order_id,
            amount = %amount
        ),
        err
    )]
    pub async fn reserve(&self, key: OrderKey, amount: Currency) -> DomainResult<Operation> {
        ensure_positive(amount)?;

        let user_id = key.user_id.clone();
        let mut tx = self.store.begin().await?;
        let operation = tx
            .insert_operation(NewOperation::reservation(key, amount))
            .await?;
        let balance = tx.withdraw(&user_id, amount).await?;
        tx.commit().await?;

        debug!(balance = %balance.amount(), "reserved");
        Ok(operation)
    }

    /// Settle a reservation: the held funds are consumed.
    #[instrument(
        skip(self, key),
        fields(
            user_id = %key.user_id,
            service_id = %key.service_id,
            order_id = %key.order_id,
            amount = %amount
        ),
        err
    )]
    pub async fn commit(&self, key: OrderKey, amount: Currency) -> DomainResult<Operation> {
        self.settle(key, amount, OperationStatus::Committed).await
    }

    /// Cancel a reservation: the held funds go back to the balance.
    #[instrument(
        skip(self, key),
        fields(
            user_id = %key.user_id,
            service_id = %key.service_id,
            order_id = %key.order_id,
            amount = %amount
        ),
        err
    )]
    pub async fn rollback(&self, key: OrderKey, amount: Currency) -> DomainResult<Operation> {
        self.settle(key, amount, OperationStatus::RolledBack).await
    }

    /// Current balance; `NotFound` if the user was never credited.
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn balance(&self, user_id: &UserId) -> DomainResult<Balance> {
        self.store
            .balance(user_id)
            .await?
            .ok_or_else(|| DomainError::not_found("balance"))
    }

    /// A page of the user's operations. Unknown users have no operations.
    #[instrument(skip(self, query), fields(user_id = %user_id, limit = query.pagination.limit), err)]
    pub async fn operations(
        &self,
        user_id: &UserId,
        query: &OperationQuery,
    ) -> DomainResult<Vec<Operation>> {
        Ok(self.store.operations(user_id, query).await?)
    }

    async fn settle(
        &self,
        key: OrderKey,
        amount: Currency,
        outcome: OperationStatus,
    ) -> DomainResult<Operation> {
        ensure_positive(amount)?;

        let mut tx = self.store.begin().await?;
        let Some(operation) = tx.lock_operation(&key).await? else {
            return abort(tx, DomainError::not_found("operation")).await;
        };

        if operation.operation_type() != OperationType::Debit
            || operation.status() != OperationStatus::Reserved
        {
            let err = DomainError::invalid_commit(format!(
                "operation is {} {}, not a reserved debit",
                operation.status(),
                operation.operation_type()
            ));
            return abort(tx, err).await;
        }
        if operation.amount() != amount {
            let err = DomainError::invalid_commit(format!(
                "reserved {} but settling {}",
                operation.amount(),
                amount
            ));
            return abort(tx, err).await;
        }

        let settled = tx
            .settle_operation(*operation.id(), amount, outcome)
            .await?;
        if outcome == OperationStatus::RolledBack {
            tx.deposit(&key.user_id, amount).await?;
        }
        tx.commit().await?;

        debug!(status = %settled.status(), "settled");
        Ok(settled)
    }
}

fn ensure_positive(amount: Currency) -> DomainResult<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(DomainError::invalid_param(format!("amount must be positive, got {amount}")))
    }
}

/// Roll back explicitly and report `err`.
async fn abort<T>(tx: Box<dyn StoreTransaction>, err: DomainError) -> DomainResult<T> {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "rollback failed");
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::store::{InMemoryLedgerStore, Pagination, SortKey};

    fn ledger() -> Ledger<InMemoryLedgerStore> {
        Ledger::new(InMemoryLedgerStore::new())
    }

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    fn key(user_id: &str, order: &str) -> OrderKey {
        OrderKey::new(user(user_id), ServiceId::parse("shop").unwrap(), OrderId::parse(order).unwrap())
    }

    fn amount(value: i64) -> Currency {
        Currency::new(value)
    }

    async fn balance_of(ledger: &Ledger<InMemoryLedgerStore>, user_id: &str) -> i64 {
        ledger.balance(&user(user_id)).await.unwrap().amount().minor_units()
    }

    #[tokio::test]
    async fn credit_reserve_commit_flow() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        assert_eq!(balance_of(&ledger, "u1").await, 100);

        let reserved = ledger.reserve(key("u1", "o1"), amount(40)).await.unwrap();
        assert_eq!(reserved.status(), OperationStatus::Reserved);
        assert_eq!(balance_of(&ledger, "u1").await, 60);

        let committed = ledger.commit(key("u1", "o1"), amount(40)).await.unwrap();
        assert_eq!(committed.status(), OperationStatus::Committed);
        assert_eq!(balance_of(&ledger, "u1").await, 60);

        let err = ledger.rollback(key("u1", "o1"), amount(40)).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidCommitValue(_)));
        assert_eq!(balance_of(&ledger, "u1").await, 60);
    }

    #[tokio::test]
    async fn credit_is_recorded_as_committed_operation() {
        let ledger = ledger();
        let op = ledger.credit(&user("u1"), amount(25), None).await.unwrap();
        assert_eq!(op.operation_type(), OperationType::Credit);
        assert_eq!(op.status(), OperationStatus::Committed);
        assert_eq!(op.service_id().as_str(), ServiceId::DEFAULT_CREDIT);

        let named = ledger
            .credit(&user("u1"), amount(5), Some(ServiceId::parse("bank").unwrap()))
            .await
            .unwrap();
        assert_eq!(named.service_id().as_str(), "bank");
        assert_ne!(named.order_id(), op.order_id());
    }

    #[tokio::test]
    async fn rollback_returns_funds() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(40)).await.unwrap();

        let op = ledger.rollback(key("u1", "o1"), amount(40)).await.unwrap();
        assert_eq!(op.status(), OperationStatus::RolledBack);
        assert_eq!(balance_of(&ledger, "u1").await, 100);

        let err = ledger.commit(key("u1", "o1"), amount(40)).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidCommitValue(_)));
        assert_eq!(balance_of(&ledger, "u1").await, 100);
    }

    #[tokio::test]
    async fn insufficient_funds_leave_balance_and_log_untouched() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(30), None).await.unwrap();

        let err = ledger.reserve(key("u1", "o1"), amount(50)).await.unwrap_err();
        assert_eq!(err, DomainError::InsufficientFunds);
        assert_eq!(balance_of(&ledger, "u1").await, 30);

        let ops = ledger
            .operations(&user("u1"), &OperationQuery::default())
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn reserve_without_balance_is_not_found() {
        let ledger = ledger();
        let err = ledger.reserve(key("ghost", "o1"), amount(1)).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
        assert!(matches!(
            ledger.balance(&user("ghost")).await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_reserve_is_rejected_once_recorded() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(10)).await.unwrap();

        let err = ledger.reserve(key("u1", "o1"), amount(10)).await.unwrap_err();
        assert_eq!(err, DomainError::DuplicateReservation);
        assert_eq!(balance_of(&ledger, "u1").await, 90);

        let ops = ledger
            .operations(&user("u1"), &OperationQuery::default())
            .await
            .unwrap();
        assert_eq!(ops.iter().filter(|o| o.operation_type() == OperationType::Debit).count(), 1);
    }

    #[tokio::test]
    async fn duplicate_reserve_wins_over_insufficient_funds() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(10), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(10)).await.unwrap();

        let err = ledger.reserve(key("u1", "o1"), amount(10)).await.unwrap_err();
        assert_eq!(err, DomainError::DuplicateReservation);
    }

    #[tokio::test]
    async fn settle_checks_amount_and_existence() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(40)).await.unwrap();

        let missing = ledger.commit(key("u1", "nope"), amount(40)).await.unwrap_err();
        assert!(matches!(missing, DomainError::NotFound(_)));

        let over = ledger.commit(key("u1", "o1"), amount(41)).await.unwrap_err();
        assert!(matches!(over, DomainError::InvalidCommitValue(_)));

        let under = ledger.rollback(key("u1", "o1"), amount(39)).await.unwrap_err();
        assert!(matches!(under, DomainError::InvalidCommitValue(_)));

        assert_eq!(balance_of(&ledger, "u1").await, 60);
        ledger.commit(key("u1", "o1"), amount(40)).await.unwrap();
    }

    #[tokio::test]
    async fn rollback_of_unknown_order_is_not_found() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(40)).await.unwrap();

        let err = ledger.rollback(key("u1", "nope"), amount(40)).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
        assert_eq!(balance_of(&ledger, "u1").await, 60);

        let ghost = ledger.rollback(key("ghost", "o1"), amount(40)).await.unwrap_err();
        assert!(matches!(ghost, DomainError::NotFound(_)));
    }

    #[tokio::test]
    async fn credit_overflow_is_internal() {
        let ledger = ledger();
        ledger.credit(&user("u1"), amount(i64::MAX), None).await.unwrap();

        let err = ledger.credit(&user("u1"), amount(1), None).await.unwrap_err();
        assert!(matches!(err, DomainError::Internal(_)));
        assert_eq!(err.code(), "internal");
        assert_eq!(balance_of(&ledger, "u1").await, i64::MAX);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_invalid_params() {
        let ledger = ledger();
        for value in [0, -5] {
            assert!(matches!(
                ledger.credit(&user("u1"), amount(value), None).await,
                Err(DomainError::InvalidParam(_))
            ));
            assert!(matches!(
                ledger.reserve(key("u1", "o1"), amount(value)).await,
                Err(DomainError::InvalidParam(_))
            ));
            assert!(matches!(
                ledger.commit(key("u1", "o1"), amount(value)).await,
                Err(DomainError::InvalidParam(_))
            ));
        }
    }

    #[tokio::test]
    async fn operations_sorted_by_value_descending() {
        let ledger = ledger();
        for value in [10, 50, 30] {
            ledger.credit(&user("u1"), amount(value), None).await.unwrap();
        }

        let query = OperationQuery {
            pagination: Pagination::new(Some(2), Some(0)),
            sort: SortKey::Value,
            descending: true,
        };
        let page = ledger.operations(&user("u1"), &query).await.unwrap();
        let amounts: Vec<i64> = page.iter().map(|o| o.amount().minor_units()).collect();
        assert_eq!(amounts, vec![50, 30]);
    }

    #[tokio::test]
    async fn operations_of_unknown_user_are_empty() {
        let ledger = ledger();
        let ops = ledger
            .operations(&user("nobody"), &OperationQuery::default())
            .await
            .unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_never_overdraw() {
        let ledger = Arc::new(ledger());
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.reserve(key("u1", &format!("o{i}")), amount(30)).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert_eq!(err, DomainError::InsufficientFunds),
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(balance_of(&ledger, "u1").await, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settlement_happens_once() {
        let ledger = Arc::new(ledger());
        ledger.credit(&user("u1"), amount(100), None).await.unwrap();
        ledger.reserve(key("u1", "o1"), amount(40)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger.commit(key("u1", "o1"), amount(40)).await
                } else {
                    ledger.rollback(key("u1", "o1"), amount(40)).await
                }
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            if let Ok(op) = handle.await.unwrap() {
                outcomes.push(op.status());
            }
        }

        assert_eq!(outcomes.len(), 1);
        let expected = match outcomes[0] {
            OperationStatus::Committed => 60,
            _ => 100,
        };
        assert_eq!(balance_of(&ledger, "u1").await, expected);
    }

    #[tokio::test]
    async fn cancelled_call_rolls_back() {
        let store = InMemoryLedgerStore::new();
        let ledger = Ledger::new(store.clone());
        ledger.credit(&user("u1"), amount(50), None).await.unwrap();

        // Hold the user's lock so the reserve blocks inside its transaction.
        let mut blocker = store.begin().await.unwrap();
        blocker.deposit(&user("u1"), amount(1)).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ledger.reserve(key("u1", "o1"), amount(10)),
        )
        .await;
        assert!(pending.is_err());
        drop(blocker);

        assert_eq!(balance_of(&ledger, "u1").await, 50);
        let ops = ledger
            .operations(&user("u1"), &OperationQuery::default())
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Credit(i64),
        Reserve(u8, i64),
        Commit(u8),
        Rollback(u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1i64..200).prop_map(Step::Credit),
            (0u8..6, 1i64..200).prop_map(|(o, a)| Step::Reserve(o, a)),
            (0u8..6).prop_map(Step::Commit),
            (0u8..6).prop_map(Step::Rollback),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn balance_equals_credits_minus_held_and_spent(steps in prop::collection::vec(step(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (balance, expected, min_seen) = runtime.block_on(async {
                let ledger = ledger();
                let mut reserved: HashMap<u8, i64> = HashMap::new();
                let mut min_seen = i64::MAX;

                for step in steps {
                    let _ = match step {
                        Step::Credit(a) => ledger.credit(&user("u1"), amount(a), None).await,
                        Step::Reserve(o, a) => {
                            let result = ledger.reserve(key("u1", &format!("o{o}")), amount(a)).await;
                            if result.is_ok() {
                                reserved.insert(o, a);
                            }
                            result
                        }
                        Step::Commit(o) => {
                            let a = reserved.get(&o).copied().unwrap_or(1);
                            ledger.commit(key("u1", &format!("o{o}")), amount(a)).await
                        }
                        Step::Rollback(o) => {
                            let a = reserved.get(&o).copied().unwrap_or(1);
                            ledger.rollback(key("u1", &format!("o{o}")), amount(a)).await
                        }
                    };
                    if let Ok(balance) = ledger.balance(&user("u1")).await {
                        min_seen = min_seen.min(balance.amount().minor_units());
                    }
                }

                let balance = ledger
                    .balance(&user("u1"))
                    .await
                    .map(|b| b.amount().minor_units())
                    .unwrap_or(0);

                let all = OperationQuery {
                    pagination: Pagination::new(Some(1000), None),
                    ..OperationQuery::default()
                };
                let ops = ledger.operations(&user("u1"), &all).await.unwrap();
                let expected: i64 = ops
                    .iter()
                    .map(|op| match (op.operation_type(), op.status()) {
                        (OperationType::Credit, _) => op.amount().minor_units(),
                        (OperationType::Debit, OperationStatus::RolledBack) => 0,
                        (OperationType::Debit, _) => -op.amount().minor_units(),
                    })
                    .sum();

                let ids: std::collections::HashSet<_> = ops.iter().map(|op| *op.id()).collect();
                assert_eq!(ids.len(), ops.len());

                (balance, expected, min_seen)
            });

            prop_assert_eq!(balance, expected);
            prop_assert!(min_seen == i64::MAX || min_seen >= 0);
        }
    }
}
