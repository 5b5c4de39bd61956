//! Billing event log
//!
//! Append-only audit feed for everything the engine does to a user's
//! subscription or money. The notification subsystem consumes these rows;
//! the engine only records them (fire-and-forget).

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events recorded in the audit feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    SubscriptionActivated,
    RenewalSucceeded,
    GracePeriodEntered,
    SubscriptionExpired,
    SubscriptionCancelled,
    AutoRenewChanged,
    PlanUpgraded,
    DowngradeScheduled,
    DowngradeApplied,
    PaymentRecorded,
    PaymentFailed,
    RefundIssued,
    DisputeOpened,
    DisputeResolved,
    InvoiceIssued,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::RenewalSucceeded => "RENEWAL_SUCCEEDED",
            BillingEventType::GracePeriodEntered => "GRACE_PERIOD_ENTERED",
            BillingEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            BillingEventType::SubscriptionCancelled => "SUBSCRIPTION_CANCELLED",
            BillingEventType::AutoRenewChanged => "AUTO_RENEW_CHANGED",
            BillingEventType::PlanUpgraded => "PLAN_UPGRADED",
            BillingEventType::DowngradeScheduled => "DOWNGRADE_SCHEDULED",
            BillingEventType::DowngradeApplied => "DOWNGRADE_APPLIED",
            BillingEventType::PaymentRecorded => "PAYMENT_RECORDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::RefundIssued => "REFUND_ISSUED",
            BillingEventType::DisputeOpened => "DISPUTE_OPENED",
            BillingEventType::DisputeResolved => "DISPUTE_RESOLVED",
            BillingEventType::InvoiceIssued => "INVOICE_ISSUED",
        }
    }
}

/// Who triggered a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    User,
    Admin,
    Gateway,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::Gateway => "gateway",
            ActorType::System => "system",
        }
    }
}

/// Builder for a billing event row
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    actor_type: ActorType,
    subscription_id: Option<Uuid>,
    external_event_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            data: serde_json::json!({}),
            actor_type: ActorType::System,
            subscription_id: None,
            external_event_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn external_event(mut self, external_event_id: &str) -> Self {
        self.external_event_id = Some(external_event_id.to_string());
        self
    }
}

/// Writes billing events to the append-only feed
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (user_id, event_type, event_data, actor_type, subscription_id, external_event_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(event.actor_type.as_str())
        .bind(event.subscription_id)
        .bind(&event.external_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Log an event, warning on failure instead of propagating.
    ///
    /// Notification emission must never fail the billing operation that
    /// produced it.
    pub async fn log_best_effort(&self, event: BillingEventBuilder) {
        let event_type = event.event_type;
        if let Err(e) = self.log_event(event).await {
            tracing::warn!(
                event_type = event_type.as_str(),
                error = %e,
                "Failed to log billing event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings_are_stable() {
        assert_eq!(
            BillingEventType::GracePeriodEntered.as_str(),
            "GRACE_PERIOD_ENTERED"
        );
        assert_eq!(
            BillingEventType::RenewalSucceeded.as_str(),
            "RENEWAL_SUCCEEDED"
        );
    }

    #[test]
    fn test_builder_defaults() {
        let user = Uuid::new_v4();
        let event = BillingEventBuilder::new(user, BillingEventType::PaymentRecorded);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.subscription_id.is_none());
        assert!(event.external_event_id.is_none());
    }
}
