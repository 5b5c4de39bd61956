//! Billing invariant checks
//!
//! Read-only SQL probes over the billing tables. Each check returns the
//! rows that violate it; a clean run returns nothing. The worker runs the
//! full set daily and the admin surface exposes it on demand.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    /// Needs a look, nothing is leaking
    Warning,
    /// Money or access is wrong right now
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub check: &'static str,
    pub severity: ViolationSeverity,
    pub message: String,
    pub entity_id: Option<Uuid>,
}

/// Runs the billing invariant suite.
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and collect the violations. Findings are logged at
    /// error level as they surface; the caller decides what else to do.
    pub async fn run_all(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_usage_within_limit().await?);
        violations.extend(self.check_refund_within_amount().await?);
        violations.extend(self.check_terminal_has_end_date().await?);
        violations.extend(self.check_transaction_subscription_owner().await?);
        violations.extend(self.check_processed_webhooks_clean().await?);

        for violation in &violations {
            tracing::error!(
                check = violation.check,
                severity = ?violation.severity,
                entity_id = ?violation.entity_id,
                "{}",
                violation.message
            );
        }

        if violations.is_empty() {
            tracing::info!("All billing invariants hold");
        }

        Ok(violations)
    }

    /// No user may hold two live subscriptions at once.
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*)
            FROM subscriptions
            WHERE status IN ('active', 'grace_period')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, count)| InvariantViolation {
                check: "single_current_subscription",
                severity: ViolationSeverity::Critical,
                message: format!("User {} holds {} live subscriptions", user_id, count),
                entity_id: Some(user_id),
            })
            .collect())
    }

    /// Recorded usage never exceeds the granting plan's limit.
    async fn check_usage_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Uuid, i64, i64)> = sqlx::query_as(
            r#"
            SELECT fu.user_id, fu.feature_id, fu.usage_count, pf.limit_value
            FROM feature_usage fu
            JOIN subscriptions s ON s.user_id = fu.user_id
                AND s.status IN ('active', 'grace_period')
            JOIN plan_features pf ON pf.plan_id = s.plan_id
                AND pf.feature_id = fu.feature_id
            WHERE pf.limit_type = 'count'
              AND pf.limit_value IS NOT NULL
              AND fu.usage_count > pf.limit_value
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, feature_id, used, limit)| InvariantViolation {
                check: "usage_within_limit",
                severity: ViolationSeverity::Critical,
                message: format!(
                    "User {} used {} of feature {} against a limit of {}",
                    user_id, used, feature_id, limit
                ),
                entity_id: Some(user_id),
            })
            .collect())
    }

    /// Cumulative refunds stay within the original transaction amount.
    async fn check_refund_within_amount(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT id, refunded_amount::text, amount::text
            FROM transactions
            WHERE refunded_amount > amount OR refunded_amount < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, refunded, amount)| InvariantViolation {
                check: "refund_within_amount",
                severity: ViolationSeverity::Critical,
                message: format!(
                    "Transaction {} refunded {} of an original {}",
                    id, refunded, amount
                ),
                entity_id: Some(id),
            })
            .collect())
    }

    /// Terminal subscriptions always carry an end date.
    async fn check_terminal_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM subscriptions
            WHERE status IN ('expired', 'cancelled') AND ends_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, status)| InvariantViolation {
                check: "terminal_has_end_date",
                severity: ViolationSeverity::Warning,
                message: format!("{} subscription {} has no end date", status, id),
                entity_id: Some(id),
            })
            .collect())
    }

    /// A transaction's subscription belongs to the transaction's user.
    async fn check_transaction_subscription_owner(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT t.id, t.user_id, s.user_id
            FROM transactions t
            JOIN subscriptions s ON s.id = t.subscription_id
            WHERE t.user_id <> s.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, txn_user, sub_user)| InvariantViolation {
                check: "transaction_subscription_owner",
                severity: ViolationSeverity::Critical,
                message: format!(
                    "Transaction {} belongs to user {} but its subscription belongs to {}",
                    id, txn_user, sub_user
                ),
                entity_id: Some(id),
            })
            .collect())
    }

    /// A processed webhook row never carries an error.
    async fn check_processed_webhooks_clean(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, COALESCE(processing_error, '')
            FROM webhook_events
            WHERE processed = true AND processing_error IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, error)| InvariantViolation {
                check: "processed_webhooks_clean",
                severity: ViolationSeverity::Warning,
                message: format!("Processed webhook {} still carries error '{}'", id, error),
                entity_id: Some(id),
            })
            .collect())
    }
}
