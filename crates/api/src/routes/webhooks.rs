//! Gateway webhook endpoints
//!
//! Each endpoint authenticates the delivery before anything in the body is
//! trusted, then hands the raw payload to the reconciler. A non-2xx
//! response makes the gateway re-deliver, which the claim logic absorbs.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use resumehq_billing::{BillingError, GatewayKind, IngestOutcome};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    header(headers, name)
        .ok_or_else(|| ApiError(BillingError::Validation(format!("Missing header {}", name))))
}

pub async fn razorpay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestOutcome>> {
    let signature = required_header(&headers, "x-razorpay-signature")?;

    state
        .engine
        .gateways
        .verify_signature(GatewayKind::Razorpay, &body, signature)
        .await?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| BillingError::Validation(format!("Malformed webhook body: {}", e)))?;
    let event_type = payload
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BillingError::Validation("Webhook body has no event field".to_string()))?
        .to_string();
    // Razorpay carries the delivery id in a header; older payloads fall
    // back to the body id.
    let external_event_id = header(&headers, "x-razorpay-event-id")
        .map(str::to_string)
        .or_else(|| {
            payload
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| BillingError::Validation("Webhook delivery has no event id".to_string()))?;

    let outcome = state
        .engine
        .webhooks
        .ingest(
            GatewayKind::Razorpay,
            &external_event_id,
            &event_type,
            &payload,
        )
        .await?;

    Ok(Json(outcome))
}

pub async fn paypal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestOutcome>> {
    // PayPal verification replays the transmission headers to its API;
    // pack them into the signature slot the adapter expects.
    let signature_blob = serde_json::json!({
        "transmission_id": required_header(&headers, "paypal-transmission-id")?,
        "transmission_time": required_header(&headers, "paypal-transmission-time")?,
        "transmission_sig": required_header(&headers, "paypal-transmission-sig")?,
        "cert_url": required_header(&headers, "paypal-cert-url")?,
        "auth_algo": required_header(&headers, "paypal-auth-algo")?,
    })
    .to_string();

    state
        .engine
        .gateways
        .verify_signature(GatewayKind::Paypal, &body, &signature_blob)
        .await?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| BillingError::Validation(format!("Malformed webhook body: {}", e)))?;
    let event_type = payload
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BillingError::Validation("Webhook body has no event_type".to_string()))?
        .to_string();
    let external_event_id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BillingError::Validation("Webhook body has no id".to_string()))?
        .to_string();

    let outcome = state
        .engine
        .webhooks
        .ingest(
            GatewayKind::Paypal,
            &external_event_id,
            &event_type,
            &payload,
        )
        .await?;

    Ok(Json(outcome))
}
