use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use purse_core::{
    Balance, Currency, Entity, NewOperation, Operation, OperationId, OperationStatus, OrderKey,
    UserId,
};

use super::query::OperationQuery;
use super::r#trait::{LedgerStore, StoreError, StoreTransaction};

/// Everything stored for one user.
#[derive(Debug, Clone, Default)]
struct Account {
    balance: Option<Currency>,
    operations: Vec<Operation>,
}

type AccountCell = Arc<AsyncMutex<Account>>;

#[derive(Debug, Default)]
struct Shared {
    accounts: Mutex<HashMap<UserId, AccountCell>>,
    next_operation_id: AtomicI64,
}

impl Shared {
    fn account(&self, user_id: &UserId) -> Result<AccountCell, StoreError> {
        let mut accounts = self
            .accounts
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(accounts.entry(user_id.clone()).or_default().clone())
    }

    fn existing_account(&self, user_id: &UserId) -> Result<Option<AccountCell>, StoreError> {
        let accounts = self
            .accounts
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(accounts.get(user_id).cloned())
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Each user's account sits behind its own async
/// mutex; a transaction takes that mutex the first time it touches the user and
/// keeps it until commit, rollback or drop, so same-user transactions run one
/// after another while different users never contend. Writes go to a working
/// copy that is published only on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: HashMap::new(),
        }))
    }

    async fn balance(&self, user_id: &UserId) -> Result<Option<Balance>, StoreError> {
        let Some(cell) = self.shared.existing_account(user_id)? else {
            return Ok(None);
        };
        let account = cell.lock().await;
        Ok(account
            .balance
            .map(|amount| Balance::new(user_id.clone(), amount)))
    }

    async fn operations(
        &self,
        user_id: &UserId,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, StoreError> {
        let Some(cell) = self.shared.existing_account(user_id)? else {
            return Ok(vec![]);
        };
        let operations = cell.lock().await.operations.clone();
        Ok(query.apply(operations))
    }
}

struct Staged {
    guard: OwnedMutexGuard<Account>,
    working: Account,
}

/// Transaction over [`InMemoryLedgerStore`]. Dropping it discards the working copies.
struct InMemoryTransaction {
    shared: Arc<Shared>,
    staged: HashMap<UserId, Staged>,
}

impl InMemoryTransaction {
    /// Lock `user_id`'s account for this transaction, creating it if needed.
    async fn stage(&mut self, user_id: &UserId) -> Result<&mut Account, StoreError> {
        self.stage_with(user_id, true)
            .await?
            .ok_or_else(|| StoreError::Storage("staged account vanished".to_string()))
    }

    /// Like [`stage`](Self::stage), but never creates an account. Paths that
    /// only read or shrink state must not leave entries for unknown users.
    async fn stage_existing(&mut self, user_id: &UserId) -> Result<Option<&mut Account>, StoreError> {
        self.stage_with(user_id, false).await
    }

    async fn stage_with(
        &mut self,
        user_id: &UserId,
        create: bool,
    ) -> Result<Option<&mut Account>, StoreError> {
        if !self.staged.contains_key(user_id) {
            let cell = if create {
                Some(self.shared.account(user_id)?)
            } else {
                self.shared.existing_account(user_id)?
            };
            let Some(cell) = cell else {
                return Ok(None);
            };
            let guard = cell.lock_owned().await;
            let working = guard.clone();
            self.staged.insert(user_id.clone(), Staged { guard, working });
        }
        Ok(self.staged.get_mut(user_id).map(|staged| &mut staged.working))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn deposit(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError> {
        let account = self.stage(user_id).await?;
        let current = account.balance.unwrap_or(Currency::ZERO);
        let updated = current
            .checked_add(amount)
            .ok_or_else(|| StoreError::Storage("balance overflow".to_string()))?;
        account.balance = Some(updated);
        Ok(Balance::new(user_id.clone(), updated))
    }

    async fn withdraw(&mut self, user_id: &UserId, amount: Currency) -> Result<Balance, StoreError> {
        let current = self
            .stage_existing(user_id)
            .await?
            .and_then(|account| account.balance)
            .ok_or_else(|| StoreError::NotFound("balance".to_string()))?;
        let account = self.stage(user_id).await?;
        let updated = current
            .checked_sub(amount)
            .filter(|value| !value.is_negative())
            .ok_or_else(|| {
                StoreError::InsufficientFunds(format!("balance {current} cannot cover {amount}"))
            })?;
        account.balance = Some(updated);
        Ok(Balance::new(user_id.clone(), updated))
    }

    async fn insert_operation(&mut self, draft: NewOperation) -> Result<Operation, StoreError> {
        let key = draft.key();
        let id = OperationId::new(self.shared.next_operation_id.fetch_add(1, Ordering::Relaxed) + 1);
        // Operations hang off an existing balance; deposit first to open one.
        let account = self
            .stage_existing(&key.user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound("balance".to_string()))?;

        if account.operations.iter().any(|op| op.key() == key) {
            return Err(StoreError::Duplicate(format!(
                "order {} of service {} already recorded",
                key.order_id, key.service_id
            )));
        }

        let now = Utc::now();
        let operation = Operation::from_parts(id, draft, now, now);
        account.operations.push(operation.clone());
        Ok(operation)
    }

    async fn lock_operation(&mut self, key: &OrderKey) -> Result<Option<Operation>, StoreError> {
        let Some(account) = self.stage_existing(&key.user_id).await? else {
            return Ok(None);
        };
        Ok(account.operations.iter().find(|op| op.key() == *key).cloned())
    }

    async fn settle_operation(
        &mut self,
        id: OperationId,
        amount: Currency,
        status: OperationStatus,
    ) -> Result<Operation, StoreError> {
        // Only rows already locked by this transaction can be settled.
        let slot = self
            .staged
            .values_mut()
            .flat_map(|staged| staged.working.operations.iter_mut())
            .find(|op| *op.id() == id)
            .ok_or_else(|| StoreError::NotFound("operation".to_string()))?;

        let remaining = slot.outstanding().checked_sub(amount);
        if remaining.is_none_or(Currency::is_negative) {
            return Err(StoreError::InvalidValue(format!(
                "cannot release {amount} from outstanding reserve {}",
                slot.outstanding()
            )));
        }

        let settled = slot.clone().with_status(status, Utc::now());
        *slot = settled.clone();
        Ok(settled)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        for (_, staged) in self.staged {
            let Staged { mut guard, working } = staged;
            *guard = working;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
