use serde::Deserialize;
use serde_json::{Value, json};

use purse_core::{Balance, Entity, Operation};
use purse_infra::store::{OperationQuery, Pagination, SortKey};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub service_id: Option<String>,
    pub currency: i64,
}

/// Body shared by reserve, commit and rollback.
#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub service_id: String,
    pub order_id: String,
    pub currency: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListOperationsParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub order_by: Option<String>,
    pub desc: Option<bool>,
}

impl ListOperationsParams {
    pub fn to_query(&self) -> Result<OperationQuery, axum::response::Response> {
        let sort = match self.order_by.as_deref() {
            None | Some("") => SortKey::Date,
            Some(raw) => raw.parse::<SortKey>().map_err(|msg| {
                errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_param", msg)
            })?,
        };

        Ok(OperationQuery {
            pagination: Pagination::new(self.limit, self.offset),
            sort,
            descending: self.desc.unwrap_or(true),
        })
    }
}

// -------------------------
// Response mapping
// -------------------------

pub fn balance_to_json(balance: &Balance) -> Value {
    json!({
        "user_id": balance.user_id(),
        "currency": balance.amount(),
    })
}

pub fn operation_to_json(op: &Operation) -> Value {
    json!({
        "id": op.id(),
        "service_id": op.service_id(),
        "order_id": op.order_id(),
        "operation_type": op.operation_type(),
        "status": op.status(),
        "value": op.amount(),
        "created_at": op.created_at().to_rfc3339(),
    })
}
