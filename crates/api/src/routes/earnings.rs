use axum::{
    extract::{Path, Query, State},
    Json,
};
use creatorpay_settlement::EarningsReport;
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsQuery {
    pub start_date: String,
    pub end_date: String,
}

fn parse_date(field: &str, raw: &str) -> ApiResult<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|_| ApiError::BadRequest(format!("{} must be an RFC 3339 timestamp", field)))
}

pub async fn creator_earnings(
    State(state): State<AppState>,
    Path(creator_id): Path<String>,
    Query(query): Query<EarningsQuery>,
) -> ApiResult<Json<EarningsReport>> {
    let start = parse_date("startDate", &query.start_date)?;
    let end = parse_date("endDate", &query.end_date)?;

    let report = state
        .settlement
        .earnings
        .report(&creator_id, start, end)
        .await?;

    Ok(Json(report))
}
