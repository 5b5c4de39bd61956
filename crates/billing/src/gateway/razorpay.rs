//! Razorpay adapter (India / INR)

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::catalog::{BillingCycle, Plan, PlanPricing};
use crate::error::{BillingError, BillingResult};

use super::{
    to_minor_units, ChargeOutcome, ChargeRequest, ChargeStatus, GatewayKind, PaymentGateway,
    RefundOutcome, GATEWAY_TIMEOUT,
};

const API_BASE: &str = "https://api.razorpay.com/v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct RazorpayGateway {
    client: reqwest::Client,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct CreatedEntity {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    amount: i64,
}

impl RazorpayGateway {
    pub fn new(key_id: String, key_secret: String, webhook_secret: String) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Gateway(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            key_id,
            key_secret,
            webhook_secret,
        })
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BillingResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", API_BASE, path))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Razorpay request failed: {}", e)))?;

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
        "Razorpay returned {}: {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}

impl PaymentGateway for RazorpayGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Razorpay
    }

    async fn verify_credentials(&self) -> BillingResult<()> {
        let response = self
            .client
            .get(format!("{}/orders?count=1", API_BASE))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| BillingError::Gateway(format!("Razorpay request failed: {}", e)))?;

        error_for_status(response).await.map(|_| ())
    }

    async fn create_plan(&self, plan: &Plan, pricing: &PlanPricing) -> BillingResult<String> {
        let period = match plan.billing_cycle {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        };
        let body = serde_json::json!({
            "period": period,
            "interval": 1,
            "item": {
                "name": plan.name,
                "amount": to_minor_units(pricing.price)?,
                "currency": pricing.currency,
            },
            "notes": { "plan_code": plan.code },
        });

        let response = self.post("/plans", &body).await?;
        let created: CreatedEntity = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Razorpay plan response malformed: {}", e)))?;

        tracing::info!(
            plan = %plan.code,
            external_plan_id = %created.id,
            "Razorpay plan created"
        );
        Ok(created.id)
    }

    async fn charge(&self, request: &ChargeRequest<'_>) -> BillingResult<ChargeOutcome> {
        let body = serde_json::json!({
            "amount": to_minor_units(request.amount)?,
            "currency": request.currency,
            "receipt": request.user_id.to_string(),
            "notes": { "description": request.description },
        });

        let response = self.post("/orders", &body).await?;
        let created: CreatedEntity = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Razorpay order response malformed: {}", e)))?;

        // Orders settle client-side; capture arrives on the webhook.
        Ok(ChargeOutcome {
            external_transaction_id: created.id,
            status: ChargeStatus::Pending,
        })
    }

    async fn refund(
        &self,
        external_transaction_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> BillingResult<RefundOutcome> {
        let body = serde_json::json!({
            "amount": to_minor_units(amount)?,
            "notes": { "reason": reason },
        });

        let response = self
            .post(&format!("/payments/{}/refund", external_transaction_id), &body)
            .await?;
        let refund: RefundResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("Razorpay refund response malformed: {}", e)))?;

        Ok(RefundOutcome {
            external_refund_id: refund.id,
            amount: Decimal::from(refund.amount) / Decimal::from(100),
        })
    }

    async fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let expected =
            hex::decode(signature.trim()).map_err(|_| BillingError::SignatureInvalid)?;

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| BillingError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> RazorpayGateway {
        RazorpayGateway::new(
            "rzp_test_key".to_string(),
            "secret".to_string(),
            "whsec_test".to_string(),
        )
        .unwrap()
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn accepts_a_correctly_signed_payload() {
        let gw = gateway();
        let payload = br#"{"event":"payment.captured"}"#;
        let signature = sign("whsec_test", payload);
        assert!(gw.verify_signature(payload, &signature).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_a_tampered_payload() {
        let gw = gateway();
        let signature = sign("whsec_test", br#"{"event":"payment.captured"}"#);
        let result = gw
            .verify_signature(br#"{"event":"payment.failed"}"#, &signature)
            .await;
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[tokio::test]
    async fn rejects_a_signature_from_the_wrong_secret() {
        let gw = gateway();
        let payload = br#"{"event":"payment.captured"}"#;
        let signature = sign("some_other_secret", payload);
        let result = gw.verify_signature(payload, &signature).await;
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[tokio::test]
    async fn rejects_non_hex_signatures() {
        let gw = gateway();
        let result = gw.verify_signature(b"{}", "not-hex!").await;
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }
}
