//! Ledger storage boundary.
//!
//! A store persists balances and operations and enforces the integrity
//! constraints (non-negative balance, non-negative outstanding reserve, unique
//! order key). It holds no business rules: the ledger engine decides what to
//! write, the store decides whether the write is allowed.
//!
//! Writes go through a scoped [`StoreTransaction`] handle:
//! `begin` → work → `commit`. Any error path simply drops the handle, which
//! rolls back.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use query::{OperationQuery, Pagination, SortKey};
pub use r#trait::{LedgerStore, StoreError, StoreTransaction};
