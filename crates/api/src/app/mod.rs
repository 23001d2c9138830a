//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: the balance service the handlers call
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::BalanceService;

/// Version prefix of the ledger endpoints.
pub const API_PREFIX: &str = "/api/v1";

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(service: Arc<BalanceService>) -> Router {
    let api = routes::router().layer(Extension(service));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest(API_PREFIX, api)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::log_requests)))
}
