use axum::{extract::State, Json};
use creatorpay_settlement::{IssueRefund, RefundReason, RefundResult};
use serde::Deserialize;

use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    pub payment_intent_id: String,
    /// Omitted means the full remaining balance
    pub amount: Option<i64>,
    #[serde(default)]
    pub reason: RefundReason,
    #[serde(default)]
    pub reverse_transfer: bool,
}

pub async fn issue_refund(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefundBody>,
) -> ApiResult<Json<RefundResult>> {
    let result = state
        .settlement
        .refunds
        .refund(IssueRefund {
            payment_intent_id: body.payment_intent_id,
            amount: body.amount,
            reason: body.reason,
            reverse_transfer: body.reverse_transfer,
        })
        .await?;

    Ok(Json(result))
}
