//! Payment intent creation

use std::collections::HashMap;

use axum::{extract::State, Json};
use creatorpay_settlement::{CreatePayment, PendingPayment};
use serde::Deserialize;

use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    pub creator_id: String,
    pub creator_account_id: String,
    pub payer_id: String,
    /// Smallest currency unit
    pub amount: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreatePaymentBody>,
) -> ApiResult<Json<PendingPayment>> {
    let pending = state
        .settlement
        .payments
        .create_payment(CreatePayment {
            creator_id: body.creator_id,
            creator_account_id: body.creator_account_id,
            payer_id: body.payer_id,
            amount: body.amount,
            metadata: body.metadata,
        })
        .await?;

    Ok(Json(pending))
}
