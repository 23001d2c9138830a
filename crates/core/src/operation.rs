//! Ledger operations: the auditable record of every balance mutation.
//!
//! A credit is recorded already `Committed`. A debit starts `Reserved` when
//! funds are put on hold and moves exactly once to `Committed` (funds consumed)
//! or `RolledBack` (funds returned to the balance).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Currency, DomainError, Entity, OperationId, OrderId, ServiceId, UserId};

/// Direction of an operation relative to the balance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Credit,
    Debit,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

impl core::str::FromStr for OperationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Self::Credit),
            "debit" => Ok(Self::Debit),
            other => Err(DomainError::invalid_param(format!("unknown operation type `{other}`"))),
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Reserved,
    Committed,
    RolledBack,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// `Committed` and `RolledBack` never change again.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl core::str::FromStr for OperationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "committed" => Ok(Self::Committed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(DomainError::invalid_param(format!("unknown operation status `{other}`"))),
        }
    }
}

impl core::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(user, service, order)` tuple that identifies a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub order_id: OrderId,
}

impl OrderKey {
    pub fn new(user_id: UserId, service_id: ServiceId, order_id: OrderId) -> Self {
        Self {
            user_id,
            service_id,
            order_id,
        }
    }
}

/// An operation before the store has assigned its id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub order_id: OrderId,
    pub operation_type: OperationType,
    pub amount: Currency,
    pub status: OperationStatus,
}

impl NewOperation {
    /// A credit: immediately final.
    pub fn credit(user_id: UserId, service_id: ServiceId, order_id: OrderId, amount: Currency) -> Self {
        Self {
            user_id,
            service_id,
            order_id,
            operation_type: OperationType::Credit,
            amount,
            status: OperationStatus::Committed,
        }
    }

    /// A debit hold awaiting commit or rollback.
    pub fn reservation(key: OrderKey, amount: Currency) -> Self {
        Self {
            user_id: key.user_id,
            service_id: key.service_id,
            order_id: key.order_id,
            operation_type: OperationType::Debit,
            amount,
            status: OperationStatus::Reserved,
        }
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.user_id.clone(), self.service_id.clone(), self.order_id.clone())
    }
}

/// A persisted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    id: OperationId,
    user_id: UserId,
    service_id: ServiceId,
    order_id: OrderId,
    operation_type: OperationType,
    amount: Currency,
    status: OperationStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Operation {
    /// Assemble a persisted operation from a draft plus store-assigned fields.
    pub fn from_parts(
        id: OperationId,
        draft: NewOperation,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: draft.user_id,
            service_id: draft.service_id,
            order_id: draft.order_id,
            operation_type: draft.operation_type,
            amount: draft.amount,
            status: draft.status,
            created_at,
            updated_at,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn amount(&self) -> Currency {
        self.amount
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Amount still on hold: the full amount while `Reserved`, zero afterwards.
    pub fn outstanding(&self) -> Currency {
        match self.status {
            OperationStatus::Reserved => self.amount,
            OperationStatus::Committed | OperationStatus::RolledBack => Currency::ZERO,
        }
    }

    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.user_id.clone(), self.service_id.clone(), self.order_id.clone())
    }

    /// Move to a new status, stamping `updated_at`.
    pub fn with_status(mut self, status: OperationStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.updated_at = at;
        self
    }
}

impl Entity for Operation {
    type Id = OperationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
