use std::sync::Arc;

use axum::{
    extract::{
        Extension, Path, Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::app::{dto, errors};
use crate::app::services::BalanceService;

pub fn router() -> Router {
    Router::new()
        .route("/:user_id", get(get_balance))
        .route("/:user_id/credit", post(credit))
        .route("/:user_id/reserve", post(reserve))
        .route("/:user_id/commit", post(commit))
        .route("/:user_id/rollback", post(rollback))
        .route("/:user_id/operations", get(list_operations))
}

pub async fn get_balance(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    match service.balance(&user_id).await {
        Ok(balance) => (StatusCode::OK, Json(dto::balance_to_json(&balance))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn credit(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
    body: Result<Json<dto::CreditRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match service
        .credit(&user_id, body.service_id.as_deref(), body.currency)
        .await
    {
        Ok(_) => ok(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn reserve(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
    body: Result<Json<dto::OrderRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match service
        .reserve(&user_id, &body.service_id, &body.order_id, body.currency)
        .await
    {
        Ok(_) => ok(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn commit(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
    body: Result<Json<dto::OrderRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match service
        .commit(&user_id, &body.service_id, &body.order_id, body.currency)
        .await
    {
        Ok(_) => ok(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn rollback(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
    body: Result<Json<dto::OrderRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match service
        .rollback(&user_id, &body.service_id, &body.order_id, body.currency)
        .await
    {
        Ok(_) => ok(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn list_operations(
    Extension(service): Extension<Arc<BalanceService>>,
    Path(user_id): Path<String>,
    params: Result<Query<dto::ListOperationsParams>, QueryRejection>,
) -> axum::response::Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return errors::query_rejection_to_response(rejection),
    };
    let query = match params.to_query() {
        Ok(query) => query,
        Err(resp) => return resp,
    };

    match service.operations(&user_id, query).await {
        Ok(ops) => {
            let items = ops.iter().map(dto::operation_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(e) => errors::domain_error_to_response(e),
    }
}

fn ok() -> axum::response::Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}
