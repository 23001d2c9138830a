//! Infrastructure layer: storage adapters, the ledger engine and configuration.

pub mod config;
pub mod ledger;
pub mod store;

pub use ledger::Ledger;
