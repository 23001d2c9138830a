//! Postgres-backed ledger store.
//!
//! Integrity lives in the schema: the balance and reserve check constraints
//! and the order-key unique constraint are the source of truth, and the
//! adapter translates their violations into `StoreError`s.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Order key already recorded |
//! | Database (check violation on `balances_amount_non_negative`) | `23514` | `InsufficientFunds` | Withdrawal would overdraw |
//! | Database (check violation, any other constraint) | `23514` | `InvalidValue` | Reserve released twice, non-positive amount |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / Tls / ... | N/A | `Storage` | Connection failures |
//!
//! ## Thread Safety
//!
//! `PostgresLedgerStore` is `Send + Sync` and cheap to clone; all access goes
//! through the SQLx connection pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use purse_core::{
    Balance, Currency, NewOperation, Operation, OperationId, OperationStatus, OperationType,
    OrderId, OrderKey, ServiceId, UserId,
};

use super::query::{OperationQuery, SortKey};
use super::r#trait::{LedgerStore, StoreError, StoreTransaction};

const BALANCE_NON_NEGATIVE: &str = "balances_amount_non_negative";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS balances (
        user_id TEXT PRIMARY KEY,
        amount BIGINT NOT NULL CONSTRAINT balances_amount_non_negative CHECK (amount >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operations (
        id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        service_id TEXT NOT NULL,
        order_id TEXT NOT NULL,
        operation_type TEXT NOT NULL CHECK (operation_type IN ('credit', 'debit')),
        amount BIGINT NOT NULL CONSTRAINT operations_amount_positive CHECK (amount > 0),
        reserve BIGINT NOT NULL CONSTRAINT operations_reserve_non_negative CHECK (reserve >= 0),
        status TEXT NOT NULL CHECK (status IN ('reserved', 'committed', 'rolled_back')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT operations_order_key_unique UNIQUE (order_id, service_id, user_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_operations_user_created
        ON operations (user_id, created_at, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_operations_user_amount
        ON operations (user_id, amount, id)
    "#,
];

const OPERATION_COLUMNS: &str =
    "id, user_id, service_id, order_id, operation_type, amount, status, created_at, updated_at";

/// Postgres-backed ledger store.
///
/// Same-user serialization comes from row locks: `withdraw`/`deposit` update
/// the balance row and `lock_operation` uses `SELECT ... FOR UPDATE`, so
/// competing transactions wait until the holder commits or rolls back.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("init_schema", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn balance(&self, user_id: &UserId) -> Result<Option<Balance>, StoreError> {
        let row = sqlx::query("SELECT user_id, amount FROM balances WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?;

        row.map(|row| decode_balance(&row)).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn operations(
        &self,
        user_id: &UserId,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, StoreError> {
        let column = match query.sort {
            SortKey::Date => "created_at",
            SortKey::Value => "amount",
        };
        let direction = if query.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE user_id = $1 \
             ORDER BY {column} {direction}, id {direction} LIMIT $2 OFFSET $3"
        );

        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(i64::from(query.pagination.limit))
            .bind(i64::from(query.pagination.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("operations", e))?;

        rows.iter().map(decode_operation).collect()
    }
}

/// Transaction over [`PostgresLedgerStore`].
///
/// Wraps a pooled `sqlx::Transaction`; dropping it without `commit` makes SQLx
/// roll back before the connection returns to the pool.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self), fields(user_id = %user_id, amount = %amount), err)]
    async fn deposit(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO balances (user_id, amount)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET
                amount = balances.amount + EXCLUDED.amount,
                updated_at = NOW()
            RETURNING user_id, amount
            "#,
        )
        .bind(user_id.as_str())
        .bind(amount.minor_units())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("deposit", e))?;

        decode_balance(&row)
    }

    #[instrument(skip(self), fields(user_id = %user_id, amount = %amount), err)]
    async fn withdraw(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE balances
            SET amount = amount - $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, amount
            "#,
        )
        .bind(user_id.as_str())
        .bind(amount.minor_units())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("withdraw", e))?;

        match row {
            Some(row) => decode_balance(&row),
            None => Err(StoreError::NotFound("balance".to_string())),
        }
    }

    #[instrument(
        skip(self, draft),
        fields(
            user_id = %draft.user_id,
            service_id = %draft.service_id,
            order_id = %draft.order_id,
            operation_type = %draft.operation_type
        ),
        err
    )]
    async fn insert_operation(&mut self, draft: NewOperation) -> Result<Operation, StoreError> {
        let reserve = match draft.status {
            OperationStatus::Reserved => draft.amount,
            OperationStatus::Committed | OperationStatus::RolledBack => Currency::ZERO,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO operations (
                user_id,
                service_id,
                order_id,
                operation_type,
                amount,
                reserve,
                status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, created_at, updated_at
            "#,
        )
        .bind(draft.user_id.as_str())
        .bind(draft.service_id.as_str())
        .bind(draft.order_id.as_str())
        .bind(draft.operation_type.as_str())
        .bind(draft.amount.minor_units())
        .bind(reserve.minor_units())
        .bind(draft.status.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_operation", e))?;

        let id: i64 = row.try_get("id").map_err(decode_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode_error)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode_error)?;

        Ok(Operation::from_parts(OperationId::new(id), draft, created_at, updated_at))
    }

    #[instrument(
        skip(self),
        fields(user_id = %key.user_id, service_id = %key.service_id, order_id = %key.order_id),
        err
    )]
    async fn lock_operation(&mut self, key: &OrderKey) -> Result<Option<Operation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE user_id = $1 AND service_id = $2 AND order_id = $3 \
             FOR UPDATE"
        );

        let row = sqlx::query(&sql)
            .bind(key.user_id.as_str())
            .bind(key.service_id.as_str())
            .bind(key.order_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_operation", e))?;

        row.as_ref().map(decode_operation).transpose()
    }

    #[instrument(skip(self), fields(operation_id = %id, amount = %amount, status = %status), err)]
    async fn settle_operation(
        &mut self,
        id: OperationId,
        amount: Currency,
        status: OperationStatus,
    ) -> Result<Operation, StoreError> {
        let sql = format!(
            "UPDATE operations \
             SET reserve = reserve - $2, status = $3, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {OPERATION_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(amount.minor_units())
            .bind(status.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("settle_operation", e))?;

        match row {
            Some(row) => decode_operation(&row),
            None => Err(StoreError::NotFound("operation".to_string())),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23514") => {
                    if db_err.constraint() == Some(BALANCE_NON_NEGATIVE) {
                        StoreError::InsufficientFunds(msg)
                    } else {
                        StoreError::InvalidValue(msg)
                    }
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out acquiring a connection in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to decode row: {err}"))
}

fn decode_balance(row: &PgRow) -> Result<Balance, StoreError> {
    let user_id: String = row.try_get("user_id").map_err(decode_error)?;
    let amount: i64 = row.try_get("amount").map_err(decode_error)?;
    let user_id = UserId::parse(user_id).map_err(|e| StoreError::Storage(e.to_string()))?;
    Ok(Balance::new(user_id, Currency::new(amount)))
}

fn decode_operation(row: &PgRow) -> Result<Operation, StoreError> {
    OperationRow::from_row(row)
        .map_err(decode_error)?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct OperationRow {
    id: i64,
    user_id: String,
    service_id: String,
    order_id: String,
    operation_type: String,
    amount: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OperationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OperationRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            service_id: row.try_get("service_id")?,
            order_id: row.try_get("order_id")?,
            operation_type: row.try_get("operation_type")?,
            amount: row.try_get("amount")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OperationRow> for Operation {
    type Error = StoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let corrupt = |e: purse_core::DomainError| StoreError::Storage(format!("corrupt operation row {}: {e}", row.id));

        let draft = NewOperation {
            user_id: UserId::parse(row.user_id.clone()).map_err(corrupt)?,
            service_id: ServiceId::parse(row.service_id.clone()).map_err(corrupt)?,
            order_id: OrderId::parse(row.order_id.clone()).map_err(corrupt)?,
            operation_type: row.operation_type.parse::<OperationType>().map_err(corrupt)?,
            amount: Currency::new(row.amount),
            status: row.status.parse::<OperationStatus>().map_err(corrupt)?,
        };

        Ok(Operation::from_parts(
            OperationId::new(row.id),
            draft,
            row.created_at,
            row.updated_at,
        ))
    }
}
