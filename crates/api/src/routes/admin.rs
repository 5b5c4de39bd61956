//! Admin surface: catalog reads, manual plan assignment, gateway
//! management, and health reports. Sits behind the deployment's admin
//! authentication proxy.

use axum::extract::{Path, Query, State};
use axum::Json;
use resumehq_billing::subscriptions::PlanChangeType;
use resumehq_billing::webhooks::FailedWebhook;
use resumehq_billing::{
    ActorType, GatewayKind, Invoice, InvariantViolation, Subscription, Transaction,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanListQuery {
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "GLOBAL".to_string()
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlanListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let plans = state.engine.catalog.list_active_plans(&query.region).await?;

    let body: Vec<serde_json::Value> = plans
        .into_iter()
        .map(|(plan, pricing)| {
            serde_json::json!({
                "id": plan.id,
                "code": plan.code,
                "name": plan.name,
                "billing_cycle": plan.billing_cycle.as_str(),
                "is_freemium": plan.is_freemium,
                "pricing": pricing,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "plans": body })))
}

#[derive(Debug, Deserialize)]
pub struct AssignPlanRequest {
    pub plan_code: String,
}

/// Manually put a user on a plan, bypassing payment. Support tool.
pub async fn assign_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<AssignPlanRequest>,
) -> ApiResult<Json<Subscription>> {
    let plan = state
        .engine
        .catalog
        .get_plan_by_code(&request.plan_code)
        .await?;
    let subscription = state
        .engine
        .subscriptions
        .activate_purchase(user_id, plan.id, None, None, ActorType::Admin)
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_code: String,
    pub change_type: PlanChangeType,
}

pub async fn request_plan_change(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    let plan = state
        .engine
        .catalog
        .get_plan_by_code(&request.plan_code)
        .await?;
    let subscription = state
        .engine
        .subscriptions
        .request_plan_change(user_id, plan.id, request.change_type, ActorType::Admin)
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .engine
        .subscriptions
        .cancel(user_id, request.immediate, ActorType::Admin)
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct AutoRenewRequest {
    pub enabled: bool,
}

pub async fn set_auto_renew(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<AutoRenewRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .engine
        .subscriptions
        .set_auto_renew(user_id, request.enabled, ActorType::Admin)
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub reason: String,
}

/// Refund a settled transaction: the gateway moves the money, then the
/// ledger records it under the cumulative bound.
pub async fn refund(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<Json<Transaction>> {
    let transaction = state.engine.payments.get_transaction(transaction_id).await?;
    resumehq_billing::payments::validate_refund(&transaction, request.amount)?;

    state
        .engine
        .gateways
        .refund(
            transaction.gateway,
            &transaction.external_transaction_id,
            request.amount,
            &request.reason,
        )
        .await?;

    let refunded = state
        .engine
        .payments
        .refund(transaction_id, request.amount, &request.reason)
        .await?;
    Ok(Json(refunded))
}

pub async fn invoices(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Invoice>>> {
    let invoices = state.engine.tax.invoices_for_user(user_id).await?;
    Ok(Json(invoices))
}

#[derive(Debug, Deserialize)]
pub struct GatewayMappingRequest {
    pub gateway: String,
    pub region: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct GatewayMappingResponse {
    pub external_plan_id: String,
}

/// Register a plan with a gateway and persist the resulting mapping.
pub async fn create_gateway_mapping(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Json(request): Json<GatewayMappingRequest>,
) -> ApiResult<Json<GatewayMappingResponse>> {
    let kind = GatewayKind::parse(&request.gateway)?;
    let plan = state.engine.catalog.get_plan(plan_id).await?;
    let pricing = state
        .engine
        .catalog
        .get_pricing(plan_id, &request.region, &request.currency)
        .await?;

    let external_plan_id = state
        .engine
        .gateways
        .create_plan(kind, &plan, &pricing)
        .await?;
    state
        .engine
        .plan_mappings
        .upsert_mapping(kind, plan_id, &pricing.currency, &external_plan_id)
        .await?;

    Ok(Json(GatewayMappingResponse { external_plan_id }))
}

pub async fn verify_gateway(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = GatewayKind::parse(&gateway)?;
    state.engine.gateways.verify_credentials(kind).await?;
    Ok(Json(serde_json::json!({ "gateway": kind.as_str(), "credentials": "valid" })))
}

pub async fn webhook_failures(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<FailedWebhook>>> {
    let failures = state.engine.webhooks.recent_failures(50).await?;
    Ok(Json(failures))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    let violations = state.engine.invariants.run_all().await?;
    Ok(Json(violations))
}
