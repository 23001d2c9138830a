use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use purse_core::DomainError;

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let code = err.code();
    match err {
        DomainError::InvalidParam(_)
        | DomainError::InsufficientFunds
        | DomainError::InvalidCommitValue(_) => {
            json_error(StatusCode::BAD_REQUEST, code, err.to_string())
        }
        DomainError::NotFound(_) => json_error(StatusCode::NOT_FOUND, code, err.to_string()),
        DomainError::DuplicateReservation => {
            json_error(StatusCode::CONFLICT, code, err.to_string())
        }
        // The cause is already logged by the service; clients get a generic message.
        DomainError::Internal(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, code, "internal error")
        }
    }
}

pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_param", rejection.body_text())
}

pub fn query_rejection_to_response(rejection: QueryRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_param", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
