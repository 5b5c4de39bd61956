//! Checkout initiation
//!
//! Creates the gateway-side order for a plan purchase. The client completes
//! payment against the returned order; settlement lands via the gateway's
//! webhook, which activates the subscription and writes the ledger row.

use axum::extract::State;
use axum::Json;
use resumehq_billing::gateway::{ChargeOutcome, ChargeRequest};
use resumehq_billing::{BillingError, GatewayKind, TaxBreakdown};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub plan_code: String,
    pub region: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub gateway: GatewayKind,
    pub order: ChargeOutcome,
    pub breakdown: TaxBreakdown,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let currency = request.currency.to_uppercase();
    let plan = state.engine.catalog.get_plan_by_code(&request.plan_code).await?;
    let pricing = state
        .engine
        .catalog
        .get_pricing(plan.id, &request.region, &currency)
        .await?;
    let breakdown = state.engine.tax.breakdown_for_pricing(&pricing).await?;

    let kind = GatewayKind::for_region(&request.region, &currency);
    // Plans without a gateway mapping still charge as one-off orders.
    let external_plan_id = match state
        .engine
        .plan_mappings
        .external_plan_id(kind, plan.id, &currency)
        .await
    {
        Ok(id) => Some(id),
        Err(BillingError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    let description = format!("{} subscription", plan.name);
    let order = state
        .engine
        .gateways
        .charge(
            kind,
            &ChargeRequest {
                user_id: request.user_id,
                amount: breakdown.total,
                currency: &currency,
                external_plan_id: external_plan_id.as_deref(),
                description: &description,
            },
        )
        .await?;

    tracing::info!(
        user_id = %request.user_id,
        plan = %plan.code,
        gateway = kind.as_str(),
        order_id = %order.external_transaction_id,
        "Checkout order created"
    );

    Ok(Json(CheckoutResponse {
        gateway: kind,
        order,
        breakdown,
    }))
}
