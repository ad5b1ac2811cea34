//! Subscription tiers

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use creatorpay_settlement::{BillingInterval, SubscribeRequest, Subscription, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeBody {
    pub creator_id: String,
    pub creator_account_id: String,
    pub payer_id: String,
    pub payer_customer_id: String,
    pub tier_name: String,
    pub amount: i64,
    /// day, week, month or year
    pub interval: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub tier_name: String,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(subscription: Subscription) -> Self {
        Self {
            subscription_id: subscription.id,
            status: subscription.status,
            tier_name: subscription.tier_name,
            amount: subscription.amount,
            current_period_end: subscription.current_period_end,
            canceled_at: subscription.canceled_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub prorate: bool,
}

pub async fn subscribe(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SubscribeBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let interval: BillingInterval = body.interval.parse()?;

    let subscription = state
        .settlement
        .subscriptions
        .subscribe(SubscribeRequest {
            creator_id: body.creator_id,
            creator_account_id: body.creator_account_id,
            payer_id: body.payer_id,
            payer_customer_id: body.payer_customer_id,
            tier_name: body.tier_name,
            amount: body.amount,
            interval,
        })
        .await?;

    Ok(Json(subscription.into()))
}

/// The body is optional; an empty one cancels without proration
pub async fn cancel(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SubscriptionResponse>> {
    let options: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid cancel body: {}", e)))?
    };

    let subscription = state
        .settlement
        .subscriptions
        .cancel(&subscription_id, options.prorate)
        .await?;

    Ok(Json(subscription.into()))
}
