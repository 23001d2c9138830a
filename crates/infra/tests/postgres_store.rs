//! Ledger engine against a real Postgres.
//!
//! Runs only when `DATABASE_URL` is set; otherwise every test returns early.
//! Each test uses fresh user ids so runs against a shared database do not
//! interfere.

use std::sync::Arc;

use purse_core::{Currency, DomainError, OperationStatus, OrderId, OrderKey, ServiceId, UserId};
use purse_infra::store::{OperationQuery, Pagination, PostgresLedgerStore, SortKey};
use purse_infra::Ledger;

async fn ledger() -> Option<Ledger<PostgresLedgerStore>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PostgresLedgerStore::connect(&url, 8).await.expect("connect");
    store.init_schema().await.expect("init schema");
    Some(Ledger::new(store))
}

fn fresh_user() -> UserId {
    UserId::parse(format!("user-{}", OrderId::generate())).unwrap()
}

fn key(user: &UserId, order: &str) -> OrderKey {
    OrderKey::new(user.clone(), ServiceId::parse("shop").unwrap(), OrderId::parse(order).unwrap())
}

#[tokio::test]
async fn reserve_commit_rollback_lifecycle() {
    let Some(ledger) = ledger().await else { return };
    let user = fresh_user();

    ledger.credit(&user, Currency::new(100), None).await.unwrap();
    ledger.reserve(key(&user, "o1"), Currency::new(40)).await.unwrap();
    assert_eq!(ledger.balance(&user).await.unwrap().amount(), Currency::new(60));

    let committed = ledger.commit(key(&user, "o1"), Currency::new(40)).await.unwrap();
    assert_eq!(committed.status(), OperationStatus::Committed);

    let err = ledger.rollback(key(&user, "o1"), Currency::new(40)).await.unwrap_err();
    assert!(matches!(err, DomainError::InvalidCommitValue(_)));

    ledger.reserve(key(&user, "o2"), Currency::new(20)).await.unwrap();
    ledger.rollback(key(&user, "o2"), Currency::new(20)).await.unwrap();
    assert_eq!(ledger.balance(&user).await.unwrap().amount(), Currency::new(60));
}

#[tokio::test]
async fn constraint_violations_map_to_domain_errors() {
    let Some(ledger) = ledger().await else { return };
    let user = fresh_user();

    let missing = ledger.reserve(key(&user, "o1"), Currency::new(1)).await.unwrap_err();
    assert!(matches!(missing, DomainError::NotFound(_)));

    ledger.credit(&user, Currency::new(30), None).await.unwrap();
    let short = ledger.reserve(key(&user, "o1"), Currency::new(50)).await.unwrap_err();
    assert_eq!(short, DomainError::InsufficientFunds);
    assert_eq!(ledger.balance(&user).await.unwrap().amount(), Currency::new(30));

    ledger.reserve(key(&user, "o1"), Currency::new(10)).await.unwrap();
    let dup = ledger.reserve(key(&user, "o1"), Currency::new(10)).await.unwrap_err();
    assert_eq!(dup, DomainError::DuplicateReservation);
    assert_eq!(ledger.balance(&user).await.unwrap().amount(), Currency::new(20));
}

#[tokio::test]
async fn listing_orders_by_value() {
    let Some(ledger) = ledger().await else { return };
    let user = fresh_user();

    for value in [10, 50, 30] {
        ledger.credit(&user, Currency::new(value), None).await.unwrap();
    }

    let query = OperationQuery {
        pagination: Pagination::new(Some(2), Some(0)),
        sort: SortKey::Value,
        descending: true,
    };
    let page = ledger.operations(&user, &query).await.unwrap();
    let amounts: Vec<i64> = page.iter().map(|op| op.amount().minor_units()).collect();
    assert_eq!(amounts, vec![50, 30]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_overdraw() {
    let Some(ledger) = ledger().await else { return };
    let ledger = Arc::new(ledger);
    let user = fresh_user();
    ledger.credit(&user, Currency::new(100), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = Arc::clone(&ledger);
        let key = key(&user, &format!("o{i}"));
        handles.push(tokio::spawn(async move { ledger.reserve(key, Currency::new(30)).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(ledger.balance(&user).await.unwrap().amount(), Currency::new(10));
}
