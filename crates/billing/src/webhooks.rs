//! Webhook reconciler
//!
//! Gateways deliver at-least-once and re-deliver logical events under
//! fresh envelope ids, so every handler must tolerate replays. Envelope
//! dedup happens at the claim (unique `(gateway, external_event_id)`);
//! logical dedup happens in the ledgers (unique transaction ids,
//! state-conditional updates).

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::gateway::{GatewayKind, PlanMappingStore};
use crate::payments::{DisputeStatus, PaymentLedger, TransactionStatus};
use crate::subscriptions::{SubscriptionService, SubscriptionStatus};
use crate::tax::TaxService;

/// How long a claim may sit in `processing` before another worker may
/// steal it.
const STUCK_PROCESSING_TIMEOUT: &str = "5 minutes";

/// Result of ingesting one webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Claimed and handled in this call
    Processed,
    /// A previous delivery already handled this event
    AlreadyProcessed,
    /// Another worker currently holds the claim
    InFlight,
    /// Recorded but intentionally not handled (unknown event type)
    Ignored,
}

/// Gateway-neutral event classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    PaymentCaptured,
    PaymentFailed,
    SubscriptionCancelled,
    RefundProcessed,
    DisputeOpened,
    DisputeUnderReview,
    DisputeClosed,
    Unknown(String),
}

impl WebhookEventType {
    /// Map a gateway's native event name onto the neutral taxonomy.
    pub fn normalize(gateway: GatewayKind, raw: &str) -> Self {
        match gateway {
            GatewayKind::Razorpay => match raw {
                "payment.captured" | "order.paid" => WebhookEventType::PaymentCaptured,
                "payment.failed" => WebhookEventType::PaymentFailed,
                "subscription.cancelled" => WebhookEventType::SubscriptionCancelled,
                "refund.processed" => WebhookEventType::RefundProcessed,
                "payment.dispute.created" => WebhookEventType::DisputeOpened,
                "payment.dispute.under_review" => WebhookEventType::DisputeUnderReview,
                "payment.dispute.won" | "payment.dispute.lost" | "payment.dispute.closed" => {
                    WebhookEventType::DisputeClosed
                }
                other => WebhookEventType::Unknown(other.to_string()),
            },
            GatewayKind::Paypal => match raw {
                "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.APPROVED" => {
                    WebhookEventType::PaymentCaptured
                }
                "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
                    WebhookEventType::PaymentFailed
                }
                "BILLING.SUBSCRIPTION.CANCELLED" => WebhookEventType::SubscriptionCancelled,
                "PAYMENT.CAPTURE.REFUNDED" => WebhookEventType::RefundProcessed,
                "CUSTOMER.DISPUTE.CREATED" => WebhookEventType::DisputeOpened,
                "CUSTOMER.DISPUTE.UPDATED" => WebhookEventType::DisputeUnderReview,
                "CUSTOMER.DISPUTE.RESOLVED" => WebhookEventType::DisputeClosed,
                other => WebhookEventType::Unknown(other.to_string()),
            },
        }
    }
}

/// Fields a payment-shaped payload must yield before a handler runs
#[derive(Debug, Clone)]
struct PaymentDetails {
    external_transaction_id: String,
    amount: Decimal,
    currency: String,
    user_id: Option<Uuid>,
    external_plan_id: Option<String>,
}

fn payload_str<'a>(payload: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    let mut value = payload;
    for key in path {
        value = value.get(key)?;
    }
    value.as_str()
}

fn parse_uuid_field(payload: &serde_json::Value, path: &[&str]) -> Option<Uuid> {
    payload_str(payload, path).and_then(|s| Uuid::parse_str(s).ok())
}

/// Pull payment fields out of a gateway payload.
///
/// Razorpay nests the entity under `payload.payment.entity` with the amount
/// in minor units; PayPal puts it under `resource` with a decimal string.
fn extract_payment(
    gateway: GatewayKind,
    payload: &serde_json::Value,
) -> BillingResult<PaymentDetails> {
    match gateway {
        GatewayKind::Razorpay => {
            let entity = payload
                .get("payload")
                .and_then(|p| p.get("payment"))
                .and_then(|p| p.get("entity"))
                .ok_or_else(|| {
                    BillingError::Validation("Razorpay payload missing payment entity".to_string())
                })?;
            let id = payload_str(entity, &["id"]).ok_or_else(|| {
                BillingError::Validation("Razorpay payment has no id".to_string())
            })?;
            let minor = entity.get("amount").and_then(|a| a.as_i64()).ok_or_else(|| {
                BillingError::Validation("Razorpay payment has no amount".to_string())
            })?;
            let currency = payload_str(entity, &["currency"]).unwrap_or("INR");

            Ok(PaymentDetails {
                external_transaction_id: id.to_string(),
                amount: Decimal::from(minor) / Decimal::from(100),
                currency: currency.to_string(),
                user_id: parse_uuid_field(entity, &["notes", "user_id"]),
                external_plan_id: payload_str(entity, &["notes", "plan_id"])
                    .map(str::to_string),
            })
        }
        GatewayKind::Paypal => {
            let resource = payload.get("resource").ok_or_else(|| {
                BillingError::Validation("PayPal payload missing resource".to_string())
            })?;
            let id = payload_str(resource, &["id"]).ok_or_else(|| {
                BillingError::Validation("PayPal resource has no id".to_string())
            })?;
            let amount = payload_str(resource, &["amount", "value"])
                .and_then(|v| v.parse::<Decimal>().ok())
                .ok_or_else(|| {
                    BillingError::Validation("PayPal resource has no amount".to_string())
                })?;
            let currency = payload_str(resource, &["amount", "currency_code"]).unwrap_or("USD");

            Ok(PaymentDetails {
                external_transaction_id: id.to_string(),
                amount,
                currency: currency.to_string(),
                user_id: parse_uuid_field(resource, &["custom_id"]),
                external_plan_id: payload_str(resource, &["plan_id"]).map(str::to_string),
            })
        }
    }
}

/// Webhook reconciler service
#[derive(Clone)]
pub struct WebhookReconciler {
    pool: PgPool,
    payments: PaymentLedger,
    subscriptions: SubscriptionService,
    catalog: PlanCatalog,
    mappings: PlanMappingStore,
    tax: TaxService,
}

impl WebhookReconciler {
    pub fn new(
        pool: PgPool,
        payments: PaymentLedger,
        subscriptions: SubscriptionService,
        catalog: PlanCatalog,
        mappings: PlanMappingStore,
        tax: TaxService,
    ) -> Self {
        Self {
            pool,
            payments,
            subscriptions,
            catalog,
            mappings,
            tax,
        }
    }

    /// Ingest one verified webhook delivery.
    ///
    /// The claim is a single INSERT..ON CONFLICT..WHERE: a fresh event
    /// inserts, a stuck `processing` row older than the timeout is stolen,
    /// and anything else (processed, or claimed recently) returns no row.
    /// The raw payload persists whatever the handler does afterwards.
    pub async fn ingest(
        &self,
        gateway: GatewayKind,
        external_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<IngestOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events
                (gateway, external_event_id, event_type, payload, processing_started_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (gateway, external_event_id) DO UPDATE
            SET processing_started_at = NOW(),
                retry_count = webhook_events.retry_count + 1
            WHERE webhook_events.processed = false
              AND (webhook_events.processing_started_at IS NULL
                   OR webhook_events.processing_started_at
                      < NOW() - INTERVAL '{STUCK_PROCESSING_TIMEOUT}')
            RETURNING id
            "#
        ))
        .bind(gateway.as_str())
        .bind(external_event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        let Some((event_id,)) = claimed else {
            let processed: Option<(bool,)> = sqlx::query_as(
                "SELECT processed FROM webhook_events WHERE gateway = $1 AND external_event_id = $2",
            )
            .bind(gateway.as_str())
            .bind(external_event_id)
            .fetch_optional(&self.pool)
            .await?;

            return Ok(match processed {
                Some((true,)) => {
                    tracing::debug!(
                        gateway = gateway.as_str(),
                        external_event_id = external_event_id,
                        "Webhook already processed, replay acknowledged"
                    );
                    IngestOutcome::AlreadyProcessed
                }
                _ => IngestOutcome::InFlight,
            });
        };

        self.process_claimed(event_id, gateway, event_type, payload)
            .await
    }

    async fn process_claimed(
        &self,
        event_id: Uuid,
        gateway: GatewayKind,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<IngestOutcome> {
        let neutral = WebhookEventType::normalize(gateway, event_type);

        let result = match &neutral {
            WebhookEventType::PaymentCaptured => self.handle_payment_captured(gateway, payload).await,
            WebhookEventType::PaymentFailed => self.handle_payment_failed(gateway, payload).await,
            WebhookEventType::SubscriptionCancelled => {
                self.handle_subscription_cancelled(gateway, payload).await
            }
            WebhookEventType::RefundProcessed => self.handle_refund(gateway, payload).await,
            WebhookEventType::DisputeOpened => self.handle_dispute_opened(gateway, payload).await,
            WebhookEventType::DisputeUnderReview => {
                self.handle_dispute_under_review(gateway, payload).await
            }
            WebhookEventType::DisputeClosed => self.handle_dispute_closed(gateway, payload).await,
            WebhookEventType::Unknown(raw) => {
                tracing::info!(
                    gateway = gateway.as_str(),
                    event_type = %raw,
                    "Unhandled webhook event type, recording and skipping"
                );
                self.mark_processed(event_id).await?;
                return Ok(IngestOutcome::Ignored);
            }
        };

        match result {
            Ok(()) => {
                self.mark_processed(event_id).await?;
                Ok(IngestOutcome::Processed)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    gateway = gateway.as_str(),
                    event_type = event_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook handler failed"
                );
                // Malformed or conflicting events will fail the same way on
                // every attempt, so cap their retries immediately.
                if e.is_retryable() {
                    sqlx::query(
                        r#"
                        UPDATE webhook_events
                        SET processing_error = $2, processing_started_at = NULL
                        WHERE id = $1
                        "#,
                    )
                    .bind(event_id)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;
                } else {
                    sqlx::query(
                        r#"
                        UPDATE webhook_events
                        SET processing_error = $2, processing_started_at = NULL,
                            retry_count = 10
                        WHERE id = $1
                        "#,
                    )
                    .bind(event_id)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;
                }
                Err(e)
            }
        }
    }

    async fn mark_processed(&self, event_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = true, processed_at = NOW(), processing_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A captured payment either renews the user's current subscription or
    /// activates the plan the payment's mapping points at. Either way the
    /// transaction lands in the ledger exactly once and an invoice is
    /// issued for newly recorded money.
    async fn handle_payment_captured(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let details = extract_payment(gateway, payload)?;

        let mapped_plan = match &details.external_plan_id {
            Some(external) => Some(
                self.mappings
                    .resolve_external(gateway, external)
                    .await?
                    .plan_id,
            ),
            None => None,
        };

        let user_id = match details.user_id {
            Some(id) => id,
            None => {
                // No user reference in the payload; fall back to the
                // transaction if we have seen this payment before.
                self.payments
                    .get_by_external(gateway, &details.external_transaction_id)
                    .await?
                    .user_id
            }
        };

        let current = self.subscriptions.current_subscription(user_id).await?;
        if current.is_none() && mapped_plan.is_none() {
            return Err(BillingError::Validation(format!(
                "Captured payment '{}' maps to no plan and user {} has no subscription",
                details.external_transaction_id, user_id
            )));
        }

        // The ledger row is the logical dedup key: the same payment
        // re-delivered under a fresh envelope id must not drive the
        // lifecycle twice, so it is recorded before any transition runs.
        let (transaction, newly_recorded) = self
            .payments
            .record_transaction(
                user_id,
                current.as_ref().map(|s| s.id),
                details.amount,
                &details.currency,
                gateway,
                &details.external_transaction_id,
                TransactionStatus::Completed,
            )
            .await?;

        let first_settlement = if newly_recorded {
            true
        } else if matches!(
            transaction.status,
            TransactionStatus::Completed | TransactionStatus::Refunded
        ) {
            false
        } else {
            // Recorded earlier (e.g. by a failure notification) but never
            // settled; this capture settles it.
            self.payments.mark_completed(transaction.id).await?;
            true
        };

        if !first_settlement {
            tracing::debug!(
                gateway = gateway.as_str(),
                external_transaction_id = %details.external_transaction_id,
                "Captured payment replayed under a fresh envelope id, no-op"
            );
            return Ok(());
        }

        let subscription = match (&current, mapped_plan) {
            // Payment for the plan the user is already on renews it.
            (Some(sub), Some(plan_id)) if sub.plan_id == plan_id => {
                self.subscriptions.record_renewal(sub.id).await?
            }
            (Some(sub), None) => self.subscriptions.record_renewal(sub.id).await?,
            // Payment for a different (or first) plan activates it.
            (_, Some(plan_id)) => {
                self.subscriptions
                    .activate_purchase(
                        user_id,
                        plan_id,
                        Some(gateway.as_str()),
                        Some(&details.external_transaction_id),
                        ActorType::Gateway,
                    )
                    .await?
            }
            // Unreachable: the no-plan-no-subscription case is rejected
            // before the transaction is recorded.
            (None, None) => {
                return Err(BillingError::Validation(format!(
                    "Captured payment '{}' maps to no plan and user {} has no subscription",
                    details.external_transaction_id, user_id
                )));
            }
        };

        // Activation opened a new subscription row; point the ledger at it.
        if transaction.subscription_id != Some(subscription.id) {
            self.payments
                .link_subscription(transaction.id, subscription.id)
                .await?;
        }

        let pricing = self
            .catalog
            .pricing_for_currency(subscription.plan_id, &details.currency)
            .await?;
        self.tax
            .issue_invoice(
                user_id,
                subscription.id,
                Some(transaction.id),
                &pricing,
                serde_json::json!({ "source": "webhook", "gateway": gateway.as_str() }),
            )
            .await?;

        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let details = extract_payment(gateway, payload)?;

        if let Some(user_id) = details.user_id {
            let (transaction, _) = self
                .payments
                .record_transaction(
                    user_id,
                    None,
                    details.amount,
                    &details.currency,
                    gateway,
                    &details.external_transaction_id,
                    TransactionStatus::Pending,
                )
                .await?;
            if transaction.status == TransactionStatus::Pending {
                self.payments.mark_failed(transaction.id).await?;
            }

            if let Some(sub) = self.subscriptions.current_subscription(user_id).await? {
                // Only a failed renewal at the period boundary opens a
                // grace window. Mid-term failures and cancelled-with-access
                // rows are ledger-only; already-graced subscriptions absorb
                // repeat failures inside enter_grace_period.
                let graceable = matches!(
                    sub.status,
                    SubscriptionStatus::Active | SubscriptionStatus::GracePeriod
                );
                if graceable && sub.ends_at <= OffsetDateTime::now_utc() {
                    self.subscriptions.enter_grace_period(sub.id).await?;
                } else {
                    tracing::debug!(
                        user_id = %user_id,
                        subscription_id = %sub.id,
                        status = sub.status.as_str(),
                        "Failed payment outside the renewal boundary, recorded only"
                    );
                }
            }
        } else {
            tracing::warn!(
                gateway = gateway.as_str(),
                external_transaction_id = %details.external_transaction_id,
                "Failed payment carries no user reference, recorded nothing"
            );
        }

        Ok(())
    }

    async fn handle_subscription_cancelled(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let user_id = match gateway {
            GatewayKind::Razorpay => parse_uuid_field(
                payload,
                &["payload", "subscription", "entity", "notes", "user_id"],
            ),
            GatewayKind::Paypal => parse_uuid_field(payload, &["resource", "custom_id"]),
        }
        .ok_or_else(|| {
            BillingError::Validation("Cancellation payload carries no user reference".to_string())
        })?;

        match self
            .subscriptions
            .cancel(user_id, false, ActorType::Gateway)
            .await
        {
            Ok(_) => Ok(()),
            // Nothing live to cancel; the gateway is behind us.
            Err(BillingError::NotFound(_)) => {
                tracing::debug!(
                    user_id = %user_id,
                    "Cancellation webhook for already-terminal subscription"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_refund(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let (external_transaction_id, amount) = match gateway {
            GatewayKind::Razorpay => {
                let entity = payload
                    .get("payload")
                    .and_then(|p| p.get("refund"))
                    .and_then(|p| p.get("entity"))
                    .ok_or_else(|| {
                        BillingError::Validation(
                            "Razorpay payload missing refund entity".to_string(),
                        )
                    })?;
                let payment_id = payload_str(entity, &["payment_id"]).ok_or_else(|| {
                    BillingError::Validation("Razorpay refund has no payment id".to_string())
                })?;
                let minor = entity.get("amount").and_then(|a| a.as_i64()).ok_or_else(|| {
                    BillingError::Validation("Razorpay refund has no amount".to_string())
                })?;
                (
                    payment_id.to_string(),
                    Decimal::from(minor) / Decimal::from(100),
                )
            }
            GatewayKind::Paypal => {
                let details = extract_payment(gateway, payload)?;
                (details.external_transaction_id, details.amount)
            }
        };

        let transaction = self
            .payments
            .get_by_external(gateway, &external_transaction_id)
            .await?;

        match self
            .payments
            .refund(transaction.id, amount, "gateway refund")
            .await
        {
            Ok(_) => Ok(()),
            // The cumulative bound rejecting a replayed refund means the
            // money is already accounted for.
            Err(BillingError::Validation(_)) if transaction.refunded_amount >= amount => {
                tracing::debug!(
                    transaction_id = %transaction.id,
                    "Refund webhook replay, already applied"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_dispute_opened(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let (external_dispute_id, external_transaction_id, reason) =
            extract_dispute(gateway, payload)?;

        let transaction = self
            .payments
            .get_by_external(gateway, &external_transaction_id)
            .await?;
        self.payments
            .open_dispute(transaction.id, &external_dispute_id, reason.as_deref())
            .await?;
        Ok(())
    }

    async fn handle_dispute_under_review(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let (external_dispute_id, _, _) = extract_dispute(gateway, payload)?;
        match self
            .payments
            .mark_dispute_under_review(&external_dispute_id)
            .await
        {
            Ok(_) => Ok(()),
            // An update delivered after the resolution carries no news.
            Err(BillingError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_dispute_closed(
        &self,
        gateway: GatewayKind,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let (external_dispute_id, _, _) = extract_dispute(gateway, payload)?;
        let won = match gateway {
            GatewayKind::Razorpay => {
                payload_str(payload, &["payload", "dispute", "entity", "status"]) == Some("won")
            }
            GatewayKind::Paypal => {
                payload_str(payload, &["resource", "dispute_outcome", "outcome_code"])
                    == Some("RESOLVED_SELLER_FAVOUR")
            }
        };
        let outcome = if won {
            DisputeStatus::Resolved
        } else {
            DisputeStatus::Rejected
        };

        match self.payments.resolve_dispute(&external_dispute_id, outcome).await {
            Ok(_) => Ok(()),
            // Replay of a resolution we already recorded.
            Err(BillingError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Re-run handlers for events whose last attempt failed.
    /// Worker entry point.
    pub async fn retry_failed(&self, limit: i64) -> BillingResult<u64> {
        let failed: Vec<(Uuid, String, String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT id, gateway, event_type, payload
            FROM webhook_events
            WHERE processed = false
              AND processing_error IS NOT NULL
              AND retry_count < 10
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for (event_id, gateway, event_type, payload) in failed {
            let gateway = GatewayKind::parse(&gateway)?;

            let claimed = sqlx::query(
                r#"
                UPDATE webhook_events
                SET processing_started_at = NOW(), retry_count = retry_count + 1
                WHERE id = $1 AND processed = false
                "#,
            )
            .bind(event_id)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            match self
                .process_claimed(event_id, gateway, &event_type, &payload)
                .await
            {
                Ok(_) => recovered += 1,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Webhook retry failed, will try again later"
                    );
                }
            }
        }

        if recovered > 0 {
            tracing::info!(recovered = recovered, "Failed webhooks recovered");
        }
        Ok(recovered)
    }

    /// Drop processed events older than the retention window.
    /// Worker entry point.
    pub async fn cleanup_processed(&self, older_than_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE processed = true
              AND processed_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted = deleted, "Old webhook events cleaned up");
        }
        Ok(deleted)
    }

    /// Recent delivery failures, for the admin surface.
    pub async fn recent_failures(&self, limit: i64) -> BillingResult<Vec<FailedWebhook>> {
        let rows: Vec<FailedWebhook> = sqlx::query_as(
            r#"
            SELECT id, gateway, external_event_id, event_type,
                   processing_error, retry_count, created_at
            FROM webhook_events
            WHERE processed = false AND processing_error IS NOT NULL
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct FailedWebhook {
    pub id: Uuid,
    pub gateway: String,
    pub external_event_id: String,
    pub event_type: String,
    pub processing_error: Option<String>,
    pub retry_count: i32,
    pub created_at: OffsetDateTime,
}

fn extract_dispute(
    gateway: GatewayKind,
    payload: &serde_json::Value,
) -> BillingResult<(String, String, Option<String>)> {
    match gateway {
        GatewayKind::Razorpay => {
            let entity = payload
                .get("payload")
                .and_then(|p| p.get("dispute"))
                .and_then(|p| p.get("entity"))
                .ok_or_else(|| {
                    BillingError::Validation("Razorpay payload missing dispute entity".to_string())
                })?;
            let id = payload_str(entity, &["id"]).ok_or_else(|| {
                BillingError::Validation("Razorpay dispute has no id".to_string())
            })?;
            let payment_id = payload_str(entity, &["payment_id"]).ok_or_else(|| {
                BillingError::Validation("Razorpay dispute has no payment id".to_string())
            })?;
            let reason = payload_str(entity, &["reason_code"]).map(str::to_string);
            Ok((id.to_string(), payment_id.to_string(), reason))
        }
        GatewayKind::Paypal => {
            let resource = payload.get("resource").ok_or_else(|| {
                BillingError::Validation("PayPal payload missing resource".to_string())
            })?;
            let id = payload_str(resource, &["dispute_id"])
                .or_else(|| payload_str(resource, &["id"]))
                .ok_or_else(|| {
                    BillingError::Validation("PayPal dispute has no id".to_string())
                })?;
            let txn = payload_str(resource, &["disputed_transactions", "0", "seller_transaction_id"])
                .or_else(|| {
                    resource
                        .get("disputed_transactions")
                        .and_then(|t| t.get(0))
                        .and_then(|t| t.get("seller_transaction_id"))
                        .and_then(|v| v.as_str())
                })
                .ok_or_else(|| {
                    BillingError::Validation("PayPal dispute has no transaction".to_string())
                })?;
            let reason = payload_str(resource, &["reason"]).map(str::to_string);
            Ok((id.to_string(), txn.to_string(), reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn razorpay_event_names_normalize() {
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Razorpay, "payment.captured"),
            WebhookEventType::PaymentCaptured
        );
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Razorpay, "refund.processed"),
            WebhookEventType::RefundProcessed
        );
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Razorpay, "payment.dispute.under_review"),
            WebhookEventType::DisputeUnderReview
        );
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Razorpay, "invoice.generated"),
            WebhookEventType::Unknown("invoice.generated".to_string())
        );
    }

    #[test]
    fn paypal_event_names_normalize() {
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Paypal, "PAYMENT.CAPTURE.COMPLETED"),
            WebhookEventType::PaymentCaptured
        );
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Paypal, "BILLING.SUBSCRIPTION.CANCELLED"),
            WebhookEventType::SubscriptionCancelled
        );
        assert_eq!(
            WebhookEventType::normalize(GatewayKind::Paypal, "CUSTOMER.DISPUTE.RESOLVED"),
            WebhookEventType::DisputeClosed
        );
    }

    #[test]
    fn razorpay_payment_amounts_come_in_minor_units() {
        let user_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_ABC123",
                        "amount": 100000,
                        "currency": "INR",
                        "notes": { "user_id": user_id.to_string(), "plan_id": "plan_pro_inr" }
                    }
                }
            }
        });

        let details = extract_payment(GatewayKind::Razorpay, &payload).unwrap();
        assert_eq!(details.external_transaction_id, "pay_ABC123");
        assert_eq!(details.amount, dec!(1000));
        assert_eq!(details.currency, "INR");
        assert_eq!(details.user_id, Some(user_id));
        assert_eq!(details.external_plan_id.as_deref(), Some("plan_pro_inr"));
    }

    #[test]
    fn paypal_payment_amounts_come_as_decimal_strings() {
        let payload = serde_json::json!({
            "resource": {
                "id": "8XY12345",
                "amount": { "value": "29.99", "currency_code": "USD" },
                "custom_id": Uuid::nil().to_string()
            }
        });

        let details = extract_payment(GatewayKind::Paypal, &payload).unwrap();
        assert_eq!(details.amount, dec!(29.99));
        assert_eq!(details.currency, "USD");
        assert_eq!(details.user_id, Some(Uuid::nil()));
    }

    #[test]
    fn malformed_payment_payloads_are_validation_errors() {
        let result = extract_payment(GatewayKind::Razorpay, &serde_json::json!({}));
        assert!(matches!(result, Err(BillingError::Validation(_))));

        let no_amount = serde_json::json!({ "resource": { "id": "x" } });
        let result = extract_payment(GatewayKind::Paypal, &no_amount);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn razorpay_dispute_extraction() {
        let payload = serde_json::json!({
            "payload": {
                "dispute": {
                    "entity": {
                        "id": "disp_001",
                        "payment_id": "pay_ABC123",
                        "reason_code": "chargeback"
                    }
                }
            }
        });
        let (dispute_id, payment_id, reason) =
            extract_dispute(GatewayKind::Razorpay, &payload).unwrap();
        assert_eq!(dispute_id, "disp_001");
        assert_eq!(payment_id, "pay_ABC123");
        assert_eq!(reason.as_deref(), Some("chargeback"));
    }
}
