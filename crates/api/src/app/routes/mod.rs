use axum::Router;

pub mod balances;
pub mod system;

/// Router for the versioned ledger endpoints.
pub fn router() -> Router {
    Router::new().nest("/balances", balances::router())
}
