//! Billing configuration, loaded from the environment once at startup.

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayConfig;

const DEFAULT_GRACE_PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub grace_period: time::Duration,
    pub gateways: Vec<GatewayConfig>,
}

impl BillingConfig {
    /// Read config from env vars. Gateways whose credentials are absent are
    /// simply not configured; at least one must be.
    pub fn from_env() -> BillingResult<Self> {
        let grace_days = match std::env::var("BILLING_GRACE_PERIOD_DAYS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                BillingError::Validation(format!(
                    "BILLING_GRACE_PERIOD_DAYS must be an integer, got '{}'",
                    raw
                ))
            })?,
            Err(_) => DEFAULT_GRACE_PERIOD_DAYS,
        };
        if grace_days < 0 {
            return Err(BillingError::Validation(
                "BILLING_GRACE_PERIOD_DAYS must not be negative".to_string(),
            ));
        }

        let mut gateways = Vec::new();

        if let (Ok(key_id), Ok(key_secret), Ok(webhook_secret)) = (
            std::env::var("RAZORPAY_KEY_ID"),
            std::env::var("RAZORPAY_KEY_SECRET"),
            std::env::var("RAZORPAY_WEBHOOK_SECRET"),
        ) {
            gateways.push(GatewayConfig::Razorpay {
                key_id,
                key_secret,
                webhook_secret,
            });
        }

        if let (Ok(client_id), Ok(client_secret), Ok(webhook_id)) = (
            std::env::var("PAYPAL_CLIENT_ID"),
            std::env::var("PAYPAL_CLIENT_SECRET"),
            std::env::var("PAYPAL_WEBHOOK_ID"),
        ) {
            let api_base = std::env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.paypal.com".to_string());
            gateways.push(GatewayConfig::Paypal {
                client_id,
                client_secret,
                webhook_id,
                api_base,
            });
        }

        if gateways.is_empty() {
            return Err(BillingError::Validation(
                "No payment gateway is configured; set RAZORPAY_* or PAYPAL_* credentials"
                    .to_string(),
            ));
        }

        Ok(Self {
            grace_period: time::Duration::days(grace_days),
            gateways,
        })
    }
}
