//! Billing error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the subscription and entitlement engine.
///
/// The taxonomy mirrors what callers need to distinguish:
/// `NotFound`, `LimitExceeded` and `Validation` are recoverable and surfaced
/// to the caller; `Gateway` feeds the webhook retry path; a `Conflict` on
/// webhook replay is treated as success by the reconciler; an
/// `InvariantViolation` is never recovered from automatically.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Usage limit exceeded for '{feature}': {used}/{limit}")]
    LimitExceeded {
        feature: String,
        used: i64,
        limit: i64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// Whether a retry of the same operation can succeed.
    ///
    /// Used by the webhook reconciler to decide whether a failed event
    /// should stay claimable for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Gateway(_) | BillingError::Database(_))
    }

    pub fn limit_exceeded(feature: &str, used: i64, limit: i64) -> Self {
        BillingError::LimitExceeded {
            feature: feature.to_string(),
            used,
            limit,
        }
    }
}

/// Validates a monetary amount: finite, positive, at most two decimal places.
pub fn validate_amount(amount: Decimal) -> BillingResult<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    if amount.scale() > 2 && amount.normalize().scale() > 2 {
        return Err(BillingError::Validation(format!(
            "Amount has more than two decimal places: {}",
            amount
        )));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_exceeded_message_names_feature() {
        let err = BillingError::limit_exceeded("resume_generation", 3, 3);
        let msg = err.to_string();
        assert!(msg.contains("resume_generation"));
        assert!(msg.contains("3/3"));
    }

    #[test]
    fn test_gateway_errors_are_retryable() {
        assert!(BillingError::Gateway("timeout".into()).is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
        assert!(!BillingError::NotFound("plan".into()).is_retryable());
    }

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(dec!(499.00)).is_ok());
        assert!(validate_amount(dec!(0.01)).is_ok());
        assert!(validate_amount(dec!(0)).is_err());
        assert!(validate_amount(dec!(-10)).is_err());
        assert!(validate_amount(dec!(1.005)).is_err());
    }
}
