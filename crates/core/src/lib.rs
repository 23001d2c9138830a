//! `purse-core`: balance ledger entity model.
//!
//! This crate contains **pure domain** data (no infrastructure concerns): the
//! balance and operation entities, the currency type, identifiers and the
//! domain error taxonomy. State-transition rules live in the ledger engine.

pub mod balance;
pub mod currency;
pub mod entity;
pub mod error;
pub mod id;
pub mod operation;

pub use balance::Balance;
pub use currency::Currency;
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{OperationId, OrderId, ServiceId, UserId};
pub use operation::{NewOperation, Operation, OperationStatus, OperationType, OrderKey};
