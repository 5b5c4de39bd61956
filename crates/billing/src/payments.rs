//! Payment ledger
//!
//! Append-mostly record of money movement. Rows are keyed by
//! `(gateway, external_transaction_id)` so webhook re-deliveries collapse
//! into no-ops; status changes are the only mutation path.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{validate_amount, BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::GatewayKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "refunded" => Ok(TransactionStatus::Refunded),
            other => Err(BillingError::Validation(format!(
                "Unknown transaction status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway: GatewayKind,
    pub external_transaction_id: String,
    pub status: TransactionStatus,
    pub refunded_amount: Decimal,
    pub refund_reason: Option<String>,
    pub refunded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Transaction {
    /// Amount still refundable on this transaction.
    pub fn refundable(&self) -> Decimal {
        self.amount - self.refunded_amount
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Transaction {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?;
        let gateway: String = row.try_get("gateway")?;
        let gateway = GatewayKind::parse(&gateway).map_err(|e| sqlx::Error::ColumnDecode {
            index: "gateway".into(),
            source: Box::new(e),
        })?;

        Ok(Transaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            subscription_id: row.try_get("subscription_id")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            gateway,
            external_transaction_id: row.try_get("external_transaction_id")?,
            status,
            refunded_amount: row.try_get("refunded_amount")?,
            refund_reason: row.try_get("refund_reason")?,
            refunded_at: row.try_get("refunded_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    /// Resolved in our favor; the money stays.
    Resolved,
    /// Lost; the gateway claws the payment back.
    Rejected,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::Resolved => "resolved",
            DisputeStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "open" => Ok(DisputeStatus::Open),
            "under_review" => Ok(DisputeStatus::UnderReview),
            "resolved" => Ok(DisputeStatus::Resolved),
            "rejected" => Ok(DisputeStatus::Rejected),
            other => Err(BillingError::Validation(format!(
                "Unknown dispute status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisputeStatus::Resolved | DisputeStatus::Rejected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dispute {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub external_dispute_id: String,
    pub status: DisputeStatus,
    pub reason: Option<String>,
    pub opened_at: OffsetDateTime,
    pub resolved_at: Option<OffsetDateTime>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Dispute {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = DisputeStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?;

        Ok(Dispute {
            id: row.try_get("id")?,
            transaction_id: row.try_get("transaction_id")?,
            external_dispute_id: row.try_get("external_dispute_id")?,
            status,
            reason: row.try_get("reason")?,
            opened_at: row.try_get("opened_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

/// Validate a refund request against what the transaction still allows.
/// The authoritative bound lives in the SQL guard; this gives callers a
/// precise error before the round trip.
pub fn validate_refund(transaction: &Transaction, amount: Decimal) -> BillingResult<()> {
    validate_amount(amount)?;
    if !matches!(
        transaction.status,
        TransactionStatus::Completed | TransactionStatus::Refunded
    ) {
        return Err(BillingError::Conflict(format!(
            "Cannot refund a {} transaction",
            transaction.status.as_str()
        )));
    }
    if amount > transaction.refundable() {
        return Err(BillingError::Validation(format!(
            "Refund of {} exceeds refundable balance {} (original {}, already refunded {})",
            amount,
            transaction.refundable(),
            transaction.amount,
            transaction.refunded_amount
        )));
    }
    Ok(())
}

const TXN_COLUMNS: &str = "id, user_id, subscription_id, amount, currency, gateway, \
     external_transaction_id, status, refunded_amount, refund_reason, refunded_at, \
     created_at, updated_at";

/// Payment ledger service
#[derive(Clone)]
pub struct PaymentLedger {
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl PaymentLedger {
    pub fn new(pool: PgPool, event_logger: BillingEventLogger) -> Self {
        Self { pool, event_logger }
    }

    /// Record a transaction seen at the gateway. Re-recording the same
    /// `(gateway, external_transaction_id)` returns the existing row
    /// untouched; the bool reports whether a new row was written.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_transaction(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
        amount: Decimal,
        currency: &str,
        gateway: GatewayKind,
        external_transaction_id: &str,
        status: TransactionStatus,
    ) -> BillingResult<(Transaction, bool)> {
        validate_amount(amount)?;

        let inserted: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            INSERT INTO transactions
                (user_id, subscription_id, amount, currency, gateway,
                 external_transaction_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (gateway, external_transaction_id) DO NOTHING
            RETURNING {TXN_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(subscription_id)
        .bind(amount)
        .bind(currency)
        .bind(gateway.as_str())
        .bind(external_transaction_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(txn) => {
                self.event_logger
                    .log_best_effort(
                        BillingEventBuilder::new(user_id, BillingEventType::PaymentRecorded)
                            .actor_type(ActorType::Gateway)
                            .data(serde_json::json!({
                                "amount": amount.to_string(),
                                "currency": currency,
                                "gateway": gateway.as_str(),
                                "external_transaction_id": external_transaction_id,
                            })),
                    )
                    .await;
                tracing::info!(
                    user_id = %user_id,
                    gateway = gateway.as_str(),
                    external_transaction_id = external_transaction_id,
                    amount = %amount,
                    "Transaction recorded"
                );
                Ok((txn, true))
            }
            None => {
                let existing = self
                    .get_by_external(gateway, external_transaction_id)
                    .await?;
                tracing::debug!(
                    gateway = gateway.as_str(),
                    external_transaction_id = external_transaction_id,
                    "Transaction already recorded"
                );
                Ok((existing, false))
            }
        }
    }

    pub async fn get_transaction(&self, id: Uuid) -> BillingResult<Transaction> {
        let txn: Option<Transaction> = sqlx::query_as(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        txn.ok_or_else(|| BillingError::NotFound(format!("Transaction {} not found", id)))
    }

    pub async fn get_by_external(
        &self,
        gateway: GatewayKind,
        external_transaction_id: &str,
    ) -> BillingResult<Transaction> {
        let txn: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM transactions
            WHERE gateway = $1 AND external_transaction_id = $2
            "#
        ))
        .bind(gateway.as_str())
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        txn.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No transaction for {} id '{}'",
                gateway.as_str(),
                external_transaction_id
            ))
        })
    }

    /// Settle a pending transaction. Settling twice is a no-op.
    pub async fn mark_completed(&self, id: Uuid) -> BillingResult<Transaction> {
        self.transition_status(id, TransactionStatus::Completed)
            .await
    }

    /// Fail a pending transaction. Failing twice is a no-op.
    pub async fn mark_failed(&self, id: Uuid) -> BillingResult<Transaction> {
        let txn = self.transition_status(id, TransactionStatus::Failed).await?;
        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(txn.user_id, BillingEventType::PaymentFailed)
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "external_transaction_id": txn.external_transaction_id,
                        "amount": txn.amount.to_string(),
                    })),
            )
            .await;
        Ok(txn)
    }

    /// Point a transaction at the subscription it settled. Used when the
    /// subscription row is created after the ledger row.
    pub async fn link_subscription(
        &self,
        id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET subscription_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        to: TransactionStatus,
    ) -> BillingResult<Transaction> {
        let updated = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        let txn = self.get_transaction(id).await?;
        if updated.rows_affected() == 0 && txn.status != to {
            return Err(BillingError::Conflict(format!(
                "Transaction {} is {}, not pending",
                id,
                txn.status.as_str()
            )));
        }
        Ok(txn)
    }

    /// Refund part or all of a completed transaction.
    ///
    /// Cumulative refunds can never exceed the original amount; the bound
    /// is enforced by the atomic update's guard, so concurrent refunds of
    /// the same transaction cannot overshoot. A refund that exhausts the
    /// amount flips the status to `refunded`.
    pub async fn refund(
        &self,
        id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> BillingResult<Transaction> {
        let txn = self.get_transaction(id).await?;
        validate_refund(&txn, amount)?;

        let refunded: Option<Transaction> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions
            SET refunded_amount = refunded_amount + $2,
                status = CASE
                    WHEN refunded_amount + $2 >= amount THEN 'refunded'
                    ELSE status
                END,
                refund_reason = $3,
                refunded_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('completed', 'refunded')
              AND refunded_amount + $2 <= amount
            RETURNING {TXN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(amount)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        let refunded = refunded.ok_or_else(|| {
            BillingError::Validation(format!(
                "Refund of {} on transaction {} rejected by cumulative bound",
                amount, id
            ))
        })?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(refunded.user_id, BillingEventType::RefundIssued)
                    .actor_type(ActorType::Admin)
                    .data(serde_json::json!({
                        "transaction_id": id.to_string(),
                        "amount": amount.to_string(),
                        "reason": reason,
                        "total_refunded": refunded.refunded_amount.to_string(),
                        "full_refund": refunded.status == TransactionStatus::Refunded,
                    })),
            )
            .await;

        tracing::info!(
            transaction_id = %id,
            amount = %amount,
            total_refunded = %refunded.refunded_amount,
            "Refund issued"
        );

        Ok(refunded)
    }

    /// Open a dispute against a transaction. Re-delivery of the same
    /// external dispute id is a no-op.
    pub async fn open_dispute(
        &self,
        transaction_id: Uuid,
        external_dispute_id: &str,
        reason: Option<&str>,
    ) -> BillingResult<Dispute> {
        let txn = self.get_transaction(transaction_id).await?;

        let inserted: Option<Dispute> = sqlx::query_as(
            r#"
            INSERT INTO disputes (transaction_id, external_dispute_id, status, reason)
            VALUES ($1, $2, 'open', $3)
            ON CONFLICT (external_dispute_id) DO NOTHING
            RETURNING id, transaction_id, external_dispute_id, status, reason,
                      opened_at, resolved_at
            "#,
        )
        .bind(transaction_id)
        .bind(external_dispute_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(dispute) => {
                self.event_logger
                    .log_best_effort(
                        BillingEventBuilder::new(txn.user_id, BillingEventType::DisputeOpened)
                            .actor_type(ActorType::Gateway)
                            .data(serde_json::json!({
                                "transaction_id": transaction_id.to_string(),
                                "external_dispute_id": external_dispute_id,
                                "reason": reason,
                            })),
                    )
                    .await;
                tracing::warn!(
                    transaction_id = %transaction_id,
                    external_dispute_id = external_dispute_id,
                    "Dispute opened"
                );
                Ok(dispute)
            }
            None => self.get_dispute_by_external(external_dispute_id).await,
        }
    }

    /// Move an open dispute under review. Re-delivery is a no-op.
    pub async fn mark_dispute_under_review(
        &self,
        external_dispute_id: &str,
    ) -> BillingResult<Dispute> {
        sqlx::query(
            r#"
            UPDATE disputes
            SET status = 'under_review', updated_at = NOW()
            WHERE external_dispute_id = $1 AND status = 'open'
            "#,
        )
        .bind(external_dispute_id)
        .execute(&self.pool)
        .await?;

        let dispute = self.get_dispute_by_external(external_dispute_id).await?;
        if dispute.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "Dispute '{}' already resolved as {}",
                external_dispute_id,
                dispute.status.as_str()
            )));
        }
        Ok(dispute)
    }

    /// Record the gateway's resolution of a dispute.
    pub async fn resolve_dispute(
        &self,
        external_dispute_id: &str,
        outcome: DisputeStatus,
    ) -> BillingResult<Dispute> {
        if !outcome.is_terminal() {
            return Err(BillingError::Validation(
                "Dispute resolution must be resolved or rejected".to_string(),
            ));
        }

        let updated = sqlx::query(
            r#"
            UPDATE disputes
            SET status = $2, resolved_at = NOW(), updated_at = NOW()
            WHERE external_dispute_id = $1 AND status IN ('open', 'under_review')
            "#,
        )
        .bind(external_dispute_id)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;

        let dispute = self.get_dispute_by_external(external_dispute_id).await?;
        if updated.rows_affected() == 0 && dispute.status != outcome {
            return Err(BillingError::Conflict(format!(
                "Dispute '{}' already resolved as {}",
                external_dispute_id,
                dispute.status.as_str()
            )));
        }

        let txn = self.get_transaction(dispute.transaction_id).await?;
        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(txn.user_id, BillingEventType::DisputeResolved)
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "external_dispute_id": external_dispute_id,
                        "outcome": outcome.as_str(),
                    })),
            )
            .await;

        Ok(dispute)
    }

    async fn get_dispute_by_external(&self, external_dispute_id: &str) -> BillingResult<Dispute> {
        let dispute: Option<Dispute> = sqlx::query_as(
            r#"
            SELECT id, transaction_id, external_dispute_id, status, reason,
                   opened_at, resolved_at
            FROM disputes
            WHERE external_dispute_id = $1
            "#,
        )
        .bind(external_dispute_id)
        .fetch_optional(&self.pool)
        .await?;

        dispute.ok_or_else(|| {
            BillingError::NotFound(format!("Dispute '{}' not found", external_dispute_id))
        })
    }

    pub async fn transactions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let txns: Vec<Transaction> = sqlx::query_as(&format!(
            r#"
            SELECT {TXN_COLUMNS}
            FROM transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(txns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn completed_txn(amount: Decimal, refunded: Decimal) -> Transaction {
        let now = OffsetDateTime::now_utc();
        Transaction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            subscription_id: None,
            amount,
            currency: "INR".to_string(),
            gateway: GatewayKind::Razorpay,
            external_transaction_id: "pay_test123".to_string(),
            status: if refunded >= amount {
                TransactionStatus::Refunded
            } else {
                TransactionStatus::Completed
            },
            refunded_amount: refunded,
            refund_reason: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn refund_within_balance_is_accepted() {
        let txn = completed_txn(dec!(1000.00), dec!(0));
        assert!(validate_refund(&txn, dec!(400.00)).is_ok());
        assert!(validate_refund(&txn, dec!(1000.00)).is_ok());
    }

    #[test]
    fn cumulative_refunds_never_exceed_the_original_amount() {
        let txn = completed_txn(dec!(1000.00), dec!(700.00));
        assert!(validate_refund(&txn, dec!(300.00)).is_ok());
        assert!(matches!(
            validate_refund(&txn, dec!(300.01)),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn fully_refunded_transactions_reject_further_refunds() {
        let txn = completed_txn(dec!(500.00), dec!(500.00));
        assert!(validate_refund(&txn, dec!(0.01)).is_err());
    }

    #[test]
    fn pending_and_failed_transactions_cannot_be_refunded() {
        let mut txn = completed_txn(dec!(100.00), dec!(0));
        txn.status = TransactionStatus::Pending;
        assert!(matches!(
            validate_refund(&txn, dec!(50.00)),
            Err(BillingError::Conflict(_))
        ));
        txn.status = TransactionStatus::Failed;
        assert!(validate_refund(&txn, dec!(50.00)).is_err());
    }

    #[test]
    fn refund_amount_must_be_positive_money() {
        let txn = completed_txn(dec!(100.00), dec!(0));
        assert!(validate_refund(&txn, dec!(0)).is_err());
        assert!(validate_refund(&txn, dec!(-5)).is_err());
        // More than two decimal places is not a money amount.
        assert!(validate_refund(&txn, dec!(1.005)).is_err());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Refunded,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TransactionStatus::parse("settled").is_err());
    }
}
