//! Video request orders

use axum::{
    extract::{Path, State},
    Json,
};
use creatorpay_settlement::Order;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverBody {
    pub video_url: String,
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    Ok(Json(state.settlement.orders.get(order_id).await?))
}

pub async fn accept(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    Ok(Json(state.settlement.orders.accept(order_id).await?))
}

pub async fn deliver(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    ApiJson(body): ApiJson<DeliverBody>,
) -> ApiResult<Json<Order>> {
    Ok(Json(
        state
            .settlement
            .orders
            .deliver(order_id, &body.video_url)
            .await?,
    ))
}

pub async fn decline(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    Ok(Json(state.settlement.orders.decline(order_id).await?))
}
