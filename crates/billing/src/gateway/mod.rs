//! Payment gateway adapter layer
//!
//! Region routing, credential config, and the adapter trait the concrete
//! gateways implement. Callers never talk to a gateway API directly; they go
//! through the [`GatewayRegistry`], which resolves the right adapter for a
//! region and dispatches statically.

mod paypal;
mod razorpay;

pub use paypal::PaypalGateway;
pub use razorpay::RazorpayGateway;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::{Plan, PlanPricing};
use crate::error::{BillingError, BillingResult};

/// Timeout applied to every outbound gateway call
pub(crate) const GATEWAY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Razorpay,
    Paypal,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Razorpay => "razorpay",
            GatewayKind::Paypal => "paypal",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "razorpay" => Ok(GatewayKind::Razorpay),
            "paypal" => Ok(GatewayKind::Paypal),
            other => Err(BillingError::Validation(format!(
                "Unknown gateway '{}'",
                other
            ))),
        }
    }

    /// Routing rule: Razorpay handles India/INR, PayPal everything else.
    pub fn for_region(region: &str, currency: &str) -> Self {
        if region.eq_ignore_ascii_case("INDIA") || currency.eq_ignore_ascii_case("INR") {
            GatewayKind::Razorpay
        } else {
            GatewayKind::Paypal
        }
    }
}

/// Credentials for one gateway, loaded from env at startup.
#[derive(Debug, Clone)]
pub enum GatewayConfig {
    Razorpay {
        key_id: String,
        key_secret: String,
        webhook_secret: String,
    },
    Paypal {
        client_id: String,
        client_secret: String,
        webhook_id: String,
        api_base: String,
    },
}

impl GatewayConfig {
    pub fn kind(&self) -> GatewayKind {
        match self {
            GatewayConfig::Razorpay { .. } => GatewayKind::Razorpay,
            GatewayConfig::Paypal { .. } => GatewayKind::Paypal,
        }
    }
}

/// Outcome of charging a customer through a gateway
#[derive(Debug, Clone, Serialize)]
pub struct ChargeOutcome {
    pub external_transaction_id: String,
    pub status: ChargeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// Gateway accepted the charge and settled it
    Captured,
    /// Gateway created the charge but settlement is still in flight
    Pending,
}

/// Outcome of a refund request
#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub external_refund_id: String,
    pub amount: Decimal,
}

/// A charge request in gateway-neutral terms
#[derive(Debug, Clone)]
pub struct ChargeRequest<'a> {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: &'a str,
    pub external_plan_id: Option<&'a str>,
    pub description: &'a str,
}

/// Adapter contract every concrete gateway implements.
///
/// Not dyn-safe (async methods); dispatch goes through [`GatewayRegistry`].
pub trait PaymentGateway {
    fn kind(&self) -> GatewayKind;

    fn supports(&self, region: &str, currency: &str) -> bool {
        GatewayKind::for_region(region, currency) == self.kind()
    }

    /// Cheap authenticated round trip proving the credentials work.
    fn verify_credentials(&self) -> impl std::future::Future<Output = BillingResult<()>> + Send;

    /// Register a plan/pricing pair with the gateway, returning its
    /// external plan id.
    fn create_plan(
        &self,
        plan: &Plan,
        pricing: &PlanPricing,
    ) -> impl std::future::Future<Output = BillingResult<String>> + Send;

    fn charge(
        &self,
        request: &ChargeRequest<'_>,
    ) -> impl std::future::Future<Output = BillingResult<ChargeOutcome>> + Send;

    fn refund(
        &self,
        external_transaction_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> impl std::future::Future<Output = BillingResult<RefundOutcome>> + Send;

    /// Authenticate a webhook delivery before its payload is trusted.
    fn verify_signature(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> impl std::future::Future<Output = BillingResult<()>> + Send;
}

/// Convert a 2dp money amount to the gateway's integer minor units.
pub(crate) fn to_minor_units(amount: Decimal) -> BillingResult<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| BillingError::Validation(format!("Amount {} out of range", amount)))
}

/// Configured gateway adapters with static dispatch by kind.
#[derive(Clone)]
pub struct GatewayRegistry {
    razorpay: Option<RazorpayGateway>,
    paypal: Option<PaypalGateway>,
}

impl GatewayRegistry {
    pub fn from_configs(configs: Vec<GatewayConfig>) -> BillingResult<Self> {
        let mut registry = Self {
            razorpay: None,
            paypal: None,
        };
        for config in configs {
            match config {
                GatewayConfig::Razorpay {
                    key_id,
                    key_secret,
                    webhook_secret,
                } => {
                    registry.razorpay =
                        Some(RazorpayGateway::new(key_id, key_secret, webhook_secret)?);
                }
                GatewayConfig::Paypal {
                    client_id,
                    client_secret,
                    webhook_id,
                    api_base,
                } => {
                    registry.paypal = Some(PaypalGateway::new(
                        client_id,
                        client_secret,
                        webhook_id,
                        api_base,
                    )?);
                }
            }
        }
        Ok(registry)
    }

    /// Gateway serving a (region, currency) pair.
    pub fn kind_for(&self, region: &str, currency: &str) -> GatewayKind {
        GatewayKind::for_region(region, currency)
    }

    fn not_configured(kind: GatewayKind) -> BillingError {
        BillingError::Gateway(format!("Gateway {} is not configured", kind.as_str()))
    }

    pub async fn verify_credentials(&self, kind: GatewayKind) -> BillingResult<()> {
        match kind {
            GatewayKind::Razorpay => {
                self.razorpay
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .verify_credentials()
                    .await
            }
            GatewayKind::Paypal => {
                self.paypal
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .verify_credentials()
                    .await
            }
        }
    }

    pub async fn create_plan(
        &self,
        kind: GatewayKind,
        plan: &Plan,
        pricing: &PlanPricing,
    ) -> BillingResult<String> {
        match kind {
            GatewayKind::Razorpay => {
                self.razorpay
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .create_plan(plan, pricing)
                    .await
            }
            GatewayKind::Paypal => {
                self.paypal
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .create_plan(plan, pricing)
                    .await
            }
        }
    }

    pub async fn charge(
        &self,
        kind: GatewayKind,
        request: &ChargeRequest<'_>,
    ) -> BillingResult<ChargeOutcome> {
        match kind {
            GatewayKind::Razorpay => {
                self.razorpay
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .charge(request)
                    .await
            }
            GatewayKind::Paypal => {
                self.paypal
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .charge(request)
                    .await
            }
        }
    }

    pub async fn refund(
        &self,
        kind: GatewayKind,
        external_transaction_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> BillingResult<RefundOutcome> {
        match kind {
            GatewayKind::Razorpay => {
                self.razorpay
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .refund(external_transaction_id, amount, reason)
                    .await
            }
            GatewayKind::Paypal => {
                self.paypal
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .refund(external_transaction_id, amount, reason)
                    .await
            }
        }
    }

    pub async fn verify_signature(
        &self,
        kind: GatewayKind,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<()> {
        match kind {
            GatewayKind::Razorpay => {
                self.razorpay
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .verify_signature(payload, signature)
                    .await
            }
            GatewayKind::Paypal => {
                self.paypal
                    .as_ref()
                    .ok_or_else(|| Self::not_configured(kind))?
                    .verify_signature(payload, signature)
                    .await
            }
        }
    }
}

/// One normalized gateway plan mapping row
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PlanMapping {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub currency: String,
    pub external_plan_id: String,
}

/// Persistence for `gateway_plan_mappings`.
///
/// The mapping used to live on the plan document as a field that was either
/// a bare string or a per-currency object; [`normalize_legacy_mapping`]
/// flattens that shape into rows when old data crosses this boundary.
#[derive(Clone)]
pub struct PlanMappingStore {
    pool: PgPool,
}

impl PlanMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve_external(
        &self,
        gateway: GatewayKind,
        external_plan_id: &str,
    ) -> BillingResult<PlanMapping> {
        let mapping: Option<PlanMapping> = sqlx::query_as(
            r#"
            SELECT id, plan_id, currency, external_plan_id
            FROM gateway_plan_mappings
            WHERE gateway = $1 AND external_plan_id = $2
            "#,
        )
        .bind(gateway.as_str())
        .bind(external_plan_id)
        .fetch_optional(&self.pool)
        .await?;

        mapping.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No plan mapped to {} plan id '{}'",
                gateway.as_str(),
                external_plan_id
            ))
        })
    }

    pub async fn external_plan_id(
        &self,
        gateway: GatewayKind,
        plan_id: Uuid,
        currency: &str,
    ) -> BillingResult<String> {
        let mapping: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT external_plan_id
            FROM gateway_plan_mappings
            WHERE gateway = $1 AND plan_id = $2 AND currency = $3
            "#,
        )
        .bind(gateway.as_str())
        .bind(plan_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;

        mapping.map(|(id,)| id).ok_or_else(|| {
            BillingError::NotFound(format!(
                "Plan {} has no {} mapping for {}",
                plan_id,
                gateway.as_str(),
                currency
            ))
        })
    }

    pub async fn upsert_mapping(
        &self,
        gateway: GatewayKind,
        plan_id: Uuid,
        currency: &str,
        external_plan_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_plan_mappings (gateway, plan_id, currency, external_plan_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (gateway, plan_id, currency)
            DO UPDATE SET external_plan_id = EXCLUDED.external_plan_id
            "#,
        )
        .bind(gateway.as_str())
        .bind(plan_id)
        .bind(currency.to_uppercase())
        .bind(external_plan_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Import a legacy mapping value for one plan, normalizing as we go.
    pub async fn import_legacy(
        &self,
        gateway: GatewayKind,
        plan_id: Uuid,
        raw: &serde_json::Value,
        default_currency: &str,
    ) -> BillingResult<usize> {
        let entries = normalize_legacy_mapping(raw, default_currency)?;
        let count = entries.len();
        for (currency, external_plan_id) in entries {
            self.upsert_mapping(gateway, plan_id, &currency, &external_plan_id)
                .await?;
        }
        Ok(count)
    }
}

/// Flatten the legacy mapping shape into `(currency, external_plan_id)`
/// pairs.
///
/// Legacy data stored either a bare string (implicitly the plan's default
/// currency) or an object keyed by currency code. Currency keys normalize
/// to uppercase; blank ids are rejected.
pub fn normalize_legacy_mapping(
    raw: &serde_json::Value,
    default_currency: &str,
) -> BillingResult<Vec<(String, String)>> {
    match raw {
        serde_json::Value::String(id) => {
            let id = id.trim();
            if id.is_empty() {
                return Err(BillingError::Validation(
                    "Legacy plan mapping is an empty string".to_string(),
                ));
            }
            Ok(vec![(default_currency.to_uppercase(), id.to_string())])
        }
        serde_json::Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (currency, value) in map {
                let id = value.as_str().map(str::trim).unwrap_or("");
                if id.is_empty() {
                    return Err(BillingError::Validation(format!(
                        "Legacy plan mapping for '{}' is not a non-empty string",
                        currency
                    )));
                }
                entries.push((currency.to_uppercase(), id.to_string()));
            }
            if entries.is_empty() {
                return Err(BillingError::Validation(
                    "Legacy plan mapping object is empty".to_string(),
                ));
            }
            Ok(entries)
        }
        other => Err(BillingError::Validation(format!(
            "Legacy plan mapping must be a string or object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn india_routes_to_razorpay_everyone_else_to_paypal() {
        assert_eq!(
            GatewayKind::for_region("INDIA", "INR"),
            GatewayKind::Razorpay
        );
        assert_eq!(
            GatewayKind::for_region("india", "inr"),
            GatewayKind::Razorpay
        );
        // Currency alone is enough to pick Razorpay.
        assert_eq!(GatewayKind::for_region("US", "INR"), GatewayKind::Razorpay);
        assert_eq!(GatewayKind::for_region("US", "USD"), GatewayKind::Paypal);
        assert_eq!(GatewayKind::for_region("EU", "EUR"), GatewayKind::Paypal);
    }

    #[test]
    fn minor_units_conversion() {
        assert_eq!(to_minor_units(dec!(499.00)).unwrap(), 49900);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
        assert_eq!(to_minor_units(dec!(1000)).unwrap(), 100000);
    }

    #[test]
    fn legacy_mapping_bare_string_uses_default_currency() {
        let raw = serde_json::json!("plan_AbC123");
        let entries = normalize_legacy_mapping(&raw, "inr").unwrap();
        assert_eq!(entries, vec![("INR".to_string(), "plan_AbC123".to_string())]);
    }

    #[test]
    fn legacy_mapping_object_normalizes_currency_case() {
        let raw = serde_json::json!({ "inr": "plan_in", "USD": "P-9XY" });
        let mut entries = normalize_legacy_mapping(&raw, "USD").unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("INR".to_string(), "plan_in".to_string()),
                ("USD".to_string(), "P-9XY".to_string()),
            ]
        );
    }

    #[test]
    fn legacy_mapping_rejects_blank_and_non_string_shapes() {
        assert!(normalize_legacy_mapping(&serde_json::json!(""), "INR").is_err());
        assert!(normalize_legacy_mapping(&serde_json::json!({ "INR": 42 }), "INR").is_err());
        assert!(normalize_legacy_mapping(&serde_json::json!(null), "INR").is_err());
        assert!(normalize_legacy_mapping(&serde_json::json!({}), "INR").is_err());
    }

    #[test]
    fn gateway_kind_round_trips() {
        assert_eq!(
            GatewayKind::parse(GatewayKind::Razorpay.as_str()).unwrap(),
            GatewayKind::Razorpay
        );
        assert_eq!(
            GatewayKind::parse(GatewayKind::Paypal.as_str()).unwrap(),
            GatewayKind::Paypal
        );
        assert!(GatewayKind::parse("stripe").is_err());
    }
}
