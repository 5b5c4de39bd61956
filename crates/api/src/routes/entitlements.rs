//! Entitlement check endpoints, called by the product on every gated action.

use axum::extract::{Path, State};
use axum::Json;
use resumehq_billing::entitlement::FeatureUsageView;
use resumehq_billing::Consumption;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    pub feature_code: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

pub async fn consume(
    State(state): State<AppState>,
    Json(request): Json<ConsumeRequest>,
) -> ApiResult<Json<Consumption>> {
    let consumption = state
        .engine
        .entitlements
        .check_and_consume(request.user_id, &request.feature_code, request.amount)
        .await?;
    Ok(Json(consumption))
}

pub async fn usage_snapshot(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<FeatureUsageView>>> {
    let snapshot = state.engine.entitlements.usage_snapshot(user_id).await?;
    Ok(Json(snapshot))
}
