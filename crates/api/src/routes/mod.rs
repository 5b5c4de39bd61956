mod admin;
mod checkout;
mod entitlements;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Gateway webhook ingestion
        .route("/webhooks/razorpay", post(webhooks::razorpay))
        .route("/webhooks/paypal", post(webhooks::paypal))
        // Purchase initiation
        .route("/billing/checkout", post(checkout::create_checkout))
        // Entitlement checks on the hot path
        .route("/entitlements/consume", post(entitlements::consume))
        .route(
            "/entitlements/{user_id}/usage",
            get(entitlements::usage_snapshot),
        )
        // Admin surface
        .route("/admin/plans", get(admin::list_plans))
        .route("/admin/users/{user_id}/plan", post(admin::assign_plan))
        .route(
            "/admin/users/{user_id}/plan-change",
            post(admin::request_plan_change),
        )
        .route("/admin/users/{user_id}/cancel", post(admin::cancel))
        .route(
            "/admin/users/{user_id}/auto-renew",
            post(admin::set_auto_renew),
        )
        .route("/admin/users/{user_id}/invoices", get(admin::invoices))
        .route(
            "/admin/transactions/{transaction_id}/refund",
            post(admin::refund),
        )
        .route(
            "/admin/plans/{plan_id}/gateway-mapping",
            post(admin::create_gateway_mapping),
        )
        .route(
            "/admin/gateways/{gateway}/verify",
            post(admin::verify_gateway),
        )
        .route("/admin/webhooks/failures", get(admin::webhook_failures))
        .route("/admin/invariants", get(admin::run_invariants))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
