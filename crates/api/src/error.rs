//! HTTP error mapping
//!
//! Every failure leaves the server as `{ "error": <code>, "message": <text> }`.
//! Internal details are logged, never returned.

use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use creatorpay_settlement::{ErrorKind, SettlementError};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::Settlement(e) => settlement_parts(e),
        }
    }
}

fn settlement_parts(e: &SettlementError) -> (StatusCode, &'static str, String) {
    use SettlementError::*;

    let (status, code) = match e {
        InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
        InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        InvalidSignature => (StatusCode::BAD_REQUEST, "invalid_signature"),
        AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
        TransactionNotFound(_) => (StatusCode::NOT_FOUND, "transaction_not_found"),
        SubscriptionNotFound(_) => (StatusCode::NOT_FOUND, "subscription_not_found"),
        OrderNotFound(_) => (StatusCode::NOT_FOUND, "order_not_found"),
        AccountNotReady { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "account_not_ready"),
        RefundExceedsBalance { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "refund_exceeds_balance"),
        IllegalTransition { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "illegal_transition"),
        Gateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
        ConsistencyFault(_) => (StatusCode::INTERNAL_SERVER_ERROR, "consistency_fault"),
        Database(_) | Publish(_) | Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    let message = match e.kind() {
        ErrorKind::Validation | ErrorKind::Authentication => e.to_string(),
        ErrorKind::Gateway => "The payment gateway rejected or could not process the request".to_string(),
        ErrorKind::Consistency | ErrorKind::Internal => "Internal server error".to_string(),
    };

    (status, code, message)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "Request rejected");
        }

        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// `Json` whose rejections use the API error body
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);
