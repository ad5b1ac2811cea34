//! Gateway webhook receiver
//!
//! The raw body is verified byte-for-byte, so it is taken as a string
//! rather than through a JSON extractor.

use axum::{extract::State, http::HeaderMap, Json};
use creatorpay_settlement::WebhookOutcome;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let outcome = state.settlement.webhooks.handle(&body, signature).await?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
