//! PayPal adapter (all regions outside India)
//!
//! PayPal does not sign webhooks with a shared secret; deliveries are
//! verified by replaying the transmission headers to its
//! verify-webhook-signature endpoint. The adapter receives those headers as
//! a JSON blob in the signature slot.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::catalog::{BillingCycle, Plan, PlanPricing};
use crate::error::{BillingError, BillingResult};

use super::{
    ChargeOutcome, ChargeRequest, ChargeStatus, GatewayKind, PaymentGateway, RefundOutcome,
    GATEWAY_TIMEOUT,
};

#[derive(Clone)]
pub struct PaypalGateway {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    webhook_id: String,
    api_base: String,
}

/// PayPal's webhook transmission headers, packed into one JSON value by the
/// HTTP layer.
#[derive(Debug, Deserialize)]
pub struct PaypalSignature {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

impl PaypalGateway {
    pub fn new(
        client_id: String,
        client_secret: String,
        webhook_id: String,
        api_base: String,
    ) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Gateway(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            client_id,
            client_secret,
            webhook_id,
            api_base,
        })
    }

    async fn access_token(&self) -> BillingResult<String> {
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal token request failed: {}", e)))?;

        let response = error_for_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal token response malformed: {}", e)))?;

        Ok(token.access_token)
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BillingResult<reqwest::Response> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal request failed: {}", e)))?;

        error_for_status(response).await
    }
}

async fn error_for_status(response: reqwest::Response) -> BillingResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BillingError::Gateway(format!(
        "PayPal returned {}: {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}

impl PaymentGateway for PaypalGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Paypal
    }

    async fn verify_credentials(&self) -> BillingResult<()> {
        self.access_token().await.map(|_| ())
    }

    async fn create_plan(&self, plan: &Plan, pricing: &PlanPricing) -> BillingResult<String> {
        let product_body = serde_json::json!({
            "name": plan.name,
            "type": "SERVICE",
        });
        let response = self.post("/v1/catalogs/products", &product_body).await?;
        let product: CreatedResource = response.json().await.map_err(|e| {
            BillingError::Gateway(format!("PayPal product response malformed: {}", e))
        })?;

        let interval_unit = match plan.billing_cycle {
            BillingCycle::Monthly => "MONTH",
            BillingCycle::Yearly => "YEAR",
        };
        let plan_body = serde_json::json!({
            "product_id": product.id,
            "name": plan.name,
            "billing_cycles": [{
                "frequency": { "interval_unit": interval_unit, "interval_count": 1 },
                "tenure_type": "REGULAR",
                "sequence": 1,
                "total_cycles": 0,
                "pricing_scheme": {
                    "fixed_price": {
                        "value": pricing.price.to_string(),
                        "currency_code": pricing.currency,
                    }
                }
            }],
            "payment_preferences": { "auto_bill_outstanding": true },
        });
        let response = self.post("/v1/billing/plans", &plan_body).await?;
        let created: CreatedResource = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal plan response malformed: {}", e)))?;

        tracing::info!(
            plan = %plan.code,
            external_plan_id = %created.id,
            "PayPal plan created"
        );
        Ok(created.id)
    }

    async fn charge(&self, request: &ChargeRequest<'_>) -> BillingResult<ChargeOutcome> {
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": {
                    "currency_code": request.currency,
                    "value": request.amount.to_string(),
                },
                "description": request.description,
                "custom_id": request.user_id.to_string(),
            }],
        });

        let response = self.post("/v2/checkout/orders", &body).await?;
        let order: OrderResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal order response malformed: {}", e)))?;

        let status = if order.status == "COMPLETED" {
            ChargeStatus::Captured
        } else {
            ChargeStatus::Pending
        };
        Ok(ChargeOutcome {
            external_transaction_id: order.id,
            status,
        })
    }

    async fn refund(
        &self,
        external_transaction_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> BillingResult<RefundOutcome> {
        let body = serde_json::json!({
            "amount": {
                "value": amount.to_string(),
                // Refund currency follows the capture; omitting it is not
                // allowed in the v2 API, USD covers all non-INR pricing.
                "currency_code": "USD",
            },
            "note_to_payer": reason,
        });

        let response = self
            .post(
                &format!("/v2/payments/captures/{}/refund", external_transaction_id),
                &body,
            )
            .await?;
        let refund: CreatedResource = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("PayPal refund response malformed: {}", e)))?;

        Ok(RefundOutcome {
            external_refund_id: refund.id,
            amount,
        })
    }

    async fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let headers: PaypalSignature =
            serde_json::from_str(signature).map_err(|_| BillingError::SignatureInvalid)?;
        let event: serde_json::Value =
            serde_json::from_slice(payload).map_err(|_| BillingError::SignatureInvalid)?;

        let body = serde_json::json!({
            "transmission_id": headers.transmission_id,
            "transmission_time": headers.transmission_time,
            "transmission_sig": headers.transmission_sig,
            "cert_url": headers.cert_url,
            "auth_algo": headers.auth_algo,
            "webhook_id": self.webhook_id,
            "webhook_event": event,
        });

        let response = self
            .post("/v1/notifications/verify-webhook-signature", &body)
            .await?;
        let verification: VerificationResponse = response.json().await.map_err(|e| {
            BillingError::Gateway(format!("PayPal verification response malformed: {}", e))
        })?;

        if verification.verification_status == "SUCCESS" {
            Ok(())
        } else {
            Err(BillingError::SignatureInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_blob_parses_paypal_transmission_headers() {
        let blob = serde_json::json!({
            "transmission_id": "abc-123",
            "transmission_time": "2026-01-05T10:00:00Z",
            "transmission_sig": "c2ln",
            "cert_url": "https://api.paypal.com/cert.pem",
            "auth_algo": "SHA256withRSA",
        })
        .to_string();

        let parsed: PaypalSignature = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed.transmission_id, "abc-123");
        assert_eq!(parsed.auth_algo, "SHA256withRSA");
    }

    #[test]
    fn malformed_signature_blob_is_rejected_before_any_network_call() {
        let parsed: Result<PaypalSignature, _> = serde_json::from_str("not json");
        assert!(parsed.is_err());
    }
}
