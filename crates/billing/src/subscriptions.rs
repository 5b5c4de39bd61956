//! Subscription lifecycle
//!
//! Owns the state machine (ACTIVE, GRACE_PERIOD, EXPIRED, CANCELLED) and
//! applies plan changes. Plan history is append-only: a genuine plan change
//! closes the old row and inserts a new one linked via `previous_plan_id`.
//! Concurrent transitions are resolved with an optimistic `version` column.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::entitlement::EntitlementLedger;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Default grace window after a failed renewal
pub const DEFAULT_GRACE_PERIOD: time::Duration = time::Duration::days(7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    GracePeriod,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::GracePeriod => "grace_period",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "grace_period" => Ok(SubscriptionStatus::GracePeriod),
            "expired" => Ok(SubscriptionStatus::Expired),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(BillingError::Validation(format!(
                "Unknown subscription status '{}'",
                other
            ))),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled
        )
    }
}

/// Whether a state machine edge exists between two statuses.
pub fn transition_allowed(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    use SubscriptionStatus::*;
    match (from, to) {
        (Active, GracePeriod) | (Active, Cancelled) | (Active, Expired) => true,
        (GracePeriod, Active) | (GracePeriod, Expired) | (GracePeriod, Cancelled) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanChangeType {
    Upgrade,
    Downgrade,
}

impl PlanChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeType::Upgrade => "upgrade",
            PlanChangeType::Downgrade => "downgrade",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "upgrade" => Ok(PlanChangeType::Upgrade),
            "downgrade" => Ok(PlanChangeType::Downgrade),
            other => Err(BillingError::Validation(format!(
                "Unknown plan change type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub started_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    /// Whether a renewal payment is expected at `ends_at`. Off for
    /// subscribers who turned renewal off; such rows expire at `ends_at`
    /// instead of entering grace.
    pub auto_renew: bool,
    pub grace_ends_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub gateway: Option<String>,
    pub external_reference: Option<String>,
    pub previous_plan_id: Option<Uuid>,
    pub pending_plan_id: Option<Uuid>,
    pub pending_change_type: Option<PlanChangeType>,
    pub pending_change_at: Option<OffsetDateTime>,
    pub version: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whether the subscription still grants entitlements right now.
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Active | SubscriptionStatus::GracePeriod => true,
            SubscriptionStatus::Cancelled => self.ends_at > now,
            SubscriptionStatus::Expired => false,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = SubscriptionStatus::parse(&status).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?;
        let pending_change_type: Option<String> = row.try_get("pending_change_type")?;
        let pending_change_type = pending_change_type
            .as_deref()
            .map(PlanChangeType::parse)
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "pending_change_type".into(),
                source: Box::new(e),
            })?;

        Ok(Subscription {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            plan_id: row.try_get("plan_id")?,
            status,
            started_at: row.try_get("started_at")?,
            ends_at: row.try_get("ends_at")?,
            auto_renew: row.try_get("auto_renew")?,
            grace_ends_at: row.try_get("grace_ends_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            gateway: row.try_get("gateway")?,
            external_reference: row.try_get("external_reference")?,
            previous_plan_id: row.try_get("previous_plan_id")?,
            pending_plan_id: row.try_get("pending_plan_id")?,
            pending_change_type,
            pending_change_at: row.try_get("pending_change_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Counters reported by one lifecycle sweep run
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepCounts {
    pub renewed_freemium: u64,
    pub entered_grace: u64,
    pub expired: u64,
    pub downgrades_applied: u64,
}

const SUB_COLUMNS: &str = "id, user_id, plan_id, status, started_at, ends_at, auto_renew, \
     grace_ends_at, cancelled_at, gateway, external_reference, previous_plan_id, \
     pending_plan_id, pending_change_type, pending_change_at, version, created_at, updated_at";

/// Subscription lifecycle service
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    catalog: PlanCatalog,
    entitlements: EntitlementLedger,
    event_logger: BillingEventLogger,
    grace_period: time::Duration,
}

impl SubscriptionService {
    pub fn new(
        pool: PgPool,
        catalog: PlanCatalog,
        entitlements: EntitlementLedger,
        event_logger: BillingEventLogger,
    ) -> Self {
        Self {
            pool,
            catalog,
            entitlements,
            event_logger,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: time::Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The user's current subscription: the single non-terminal row, or a
    /// cancelled row whose paid period has not ended yet.
    pub async fn current_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUB_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1
              AND (status IN ('active', 'grace_period')
                   OR (status = 'cancelled' AND ends_at > NOW()))
            ORDER BY started_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn get_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUB_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| BillingError::NotFound(format!("Subscription {} not found", id)))
    }

    /// Activate a subscription after a verified purchase.
    ///
    /// Any existing non-terminal subscription is closed first and linked to
    /// the new row, so one user never holds two live subscriptions.
    pub async fn activate_purchase(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        gateway: Option<&str>,
        external_reference: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.get_plan(plan_id).await?;
        let now = OffsetDateTime::now_utc();
        let ends_at = now + plan.billing_cycle.period();

        let mut tx = self.pool.begin().await?;

        let previous: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW(), version = version + 1
            WHERE user_id = $1 AND status IN ('active', 'grace_period')
            RETURNING id, plan_id
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let sub: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, started_at, ends_at, gateway,
                 external_reference, previous_plan_id)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
            RETURNING {SUB_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(plan_id)
        .bind(now)
        .bind(ends_at)
        .bind(gateway)
        .bind(external_reference)
        .bind(previous.map(|(_, p)| p))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.entitlements.reissue_entitlements(user_id, plan_id).await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionActivated)
                    .subscription(sub.id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "plan_code": plan.code,
                        "ends_at": ends_at.to_string(),
                        "gateway": gateway,
                    })),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            plan = %plan.code,
            subscription_id = %sub.id,
            "Subscription activated"
        );

        Ok(sub)
    }

    /// Record a successful renewal payment.
    ///
    /// Extends the paid period by one billing cycle and clears any grace
    /// window. Valid from ACTIVE and GRACE_PERIOD.
    pub async fn record_renewal(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_subscription(subscription_id).await?;
        if !matches!(
            sub.status,
            SubscriptionStatus::Active | SubscriptionStatus::GracePeriod
        ) {
            return Err(BillingError::Conflict(format!(
                "Cannot renew subscription {} in status {}",
                subscription_id,
                sub.status.as_str()
            )));
        }

        // Renewals run on whatever plan the subscriber holds, retired or not.
        let plan = self.catalog.get_plan_any_status(sub.plan_id).await?;
        let now = OffsetDateTime::now_utc();
        // Renewals extend the existing period; late renewals start from now.
        let base = if sub.ends_at > now { sub.ends_at } else { now };
        let ends_at = base + plan.billing_cycle.period();

        let updated = self
            .versioned_update(
                sub.id,
                sub.version,
                r#"
                UPDATE subscriptions
                SET status = 'active', ends_at = $3, grace_ends_at = NULL,
                    updated_at = NOW(), version = version + 1
                WHERE id = $1 AND version = $2
                "#,
                |q| q.bind(ends_at),
            )
            .await?;

        self.entitlements
            .reissue_entitlements(sub.user_id, sub.plan_id)
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(sub.user_id, BillingEventType::RenewalSucceeded)
                    .subscription(sub.id)
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({ "ends_at": ends_at.to_string() })),
            )
            .await;

        Ok(updated)
    }

    /// Move an ACTIVE subscription into its grace window after a failed
    /// renewal. Entitlements stay live until the window lapses.
    pub async fn enter_grace_period(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_subscription(subscription_id).await?;
        if sub.status == SubscriptionStatus::GracePeriod {
            // Repeated failure notifications are a no-op.
            return Ok(sub);
        }
        if !transition_allowed(sub.status, SubscriptionStatus::GracePeriod) {
            return Err(BillingError::Conflict(format!(
                "Cannot enter grace period from status {}",
                sub.status.as_str()
            )));
        }

        let grace_ends_at = OffsetDateTime::now_utc() + self.grace_period;
        let updated = self
            .versioned_update(
                sub.id,
                sub.version,
                r#"
                UPDATE subscriptions
                SET status = 'grace_period', grace_ends_at = $3,
                    updated_at = NOW(), version = version + 1
                WHERE id = $1 AND version = $2
                "#,
                |q| q.bind(grace_ends_at),
            )
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(sub.user_id, BillingEventType::GracePeriodEntered)
                    .subscription(sub.id)
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({ "grace_ends_at": grace_ends_at.to_string() })),
            )
            .await;

        tracing::warn!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            grace_ends_at = %grace_ends_at,
            "Subscription entered grace period"
        );

        Ok(updated)
    }

    /// Expire a subscription whose grace window (or paid period) has
    /// lapsed, then fall the user back to the freemium plan if one exists.
    pub async fn expire(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get_subscription(subscription_id).await?;
        if !transition_allowed(sub.status, SubscriptionStatus::Expired) {
            return Err(BillingError::Conflict(format!(
                "Cannot expire subscription in status {}",
                sub.status.as_str()
            )));
        }

        let updated = self
            .versioned_update(
                sub.id,
                sub.version,
                r#"
                UPDATE subscriptions
                SET status = 'expired', grace_ends_at = NULL,
                    updated_at = NOW(), version = version + 1
                WHERE id = $1 AND version = $2
                "#,
                |q| q,
            )
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(sub.user_id, BillingEventType::SubscriptionExpired)
                    .subscription(sub.id)
                    .actor_type(ActorType::System),
            )
            .await;

        // Expired users keep working under the freemium plan, if one exists.
        if let Some(freemium) = self.catalog.freemium_plan().await? {
            self.activate_purchase(sub.user_id, freemium.id, None, None, ActorType::System)
                .await?;
        }

        tracing::info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            "Subscription expired"
        );

        Ok(updated)
    }

    /// Cancel the user's current subscription.
    ///
    /// Immediate cancellation ends access now; otherwise access continues
    /// until the already-paid period ends. Either way the row becomes
    /// terminal and any pending plan change is dropped.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        immediate: bool,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .current_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No live subscription for user {}", user_id)))?;

        if sub.status == SubscriptionStatus::Cancelled {
            return Ok(sub);
        }
        if !transition_allowed(sub.status, SubscriptionStatus::Cancelled) {
            return Err(BillingError::Conflict(format!(
                "Cannot cancel subscription in status {}",
                sub.status.as_str()
            )));
        }

        let now = OffsetDateTime::now_utc();
        let ends_at = if immediate { now } else { sub.ends_at };

        let updated = self
            .versioned_update(
                sub.id,
                sub.version,
                r#"
                UPDATE subscriptions
                SET status = 'cancelled', cancelled_at = NOW(), ends_at = $3,
                    auto_renew = false, grace_ends_at = NULL,
                    pending_plan_id = NULL, pending_change_type = NULL,
                    pending_change_at = NULL,
                    updated_at = NOW(), version = version + 1
                WHERE id = $1 AND version = $2
                "#,
                |q| q.bind(ends_at),
            )
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCancelled)
                    .subscription(sub.id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "immediate": immediate,
                        "access_until": ends_at.to_string(),
                    })),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            immediate = immediate,
            "Subscription cancelled"
        );

        Ok(updated)
    }

    /// Turn the renewal expectation on or off for the user's current
    /// subscription. With it off, the subscription expires at `ends_at`
    /// instead of waiting out a grace window.
    pub async fn set_auto_renew(
        &self,
        user_id: Uuid,
        enabled: bool,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .current_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No live subscription for user {}", user_id)))?;

        if sub.status.is_terminal() {
            return Err(BillingError::Conflict(
                "Cannot change renewal on a cancelled subscription".to_string(),
            ));
        }
        if sub.auto_renew == enabled {
            return Ok(sub);
        }

        let updated = self
            .versioned_update(
                sub.id,
                sub.version,
                r#"
                UPDATE subscriptions
                SET auto_renew = $3, updated_at = NOW(), version = version + 1
                WHERE id = $1 AND version = $2
                "#,
                |q| q.bind(enabled),
            )
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::AutoRenewChanged)
                    .subscription(sub.id)
                    .actor_type(actor)
                    .data(serde_json::json!({ "auto_renew": enabled })),
            )
            .await;

        Ok(updated)
    }

    /// Change plan on a live subscription.
    ///
    /// Upgrades apply immediately with a fresh billing period. Downgrades
    /// are scheduled for the end of the current period so already-paid
    /// entitlements are not clawed back.
    pub async fn request_plan_change(
        &self,
        user_id: Uuid,
        new_plan_id: Uuid,
        change_type: PlanChangeType,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let sub = self
            .current_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No live subscription for user {}", user_id)))?;

        if sub.status.is_terminal() {
            return Err(BillingError::Conflict(
                "Cannot change plan on a cancelled subscription".to_string(),
            ));
        }
        if sub.plan_id == new_plan_id {
            return Err(BillingError::Validation(
                "New plan matches current plan".to_string(),
            ));
        }
        let new_plan = self.catalog.get_plan(new_plan_id).await?;

        match change_type {
            PlanChangeType::Upgrade => {
                let replacement = self
                    .replace_plan(&sub, new_plan_id, BillingEventType::PlanUpgraded, actor)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    plan = %new_plan.code,
                    "Plan upgraded"
                );
                Ok(replacement)
            }
            PlanChangeType::Downgrade => {
                let updated = self
                    .versioned_update(
                        sub.id,
                        sub.version,
                        r#"
                        UPDATE subscriptions
                        SET pending_plan_id = $3, pending_change_type = 'downgrade',
                            pending_change_at = ends_at,
                            updated_at = NOW(), version = version + 1
                        WHERE id = $1 AND version = $2
                        "#,
                        |q| q.bind(new_plan_id),
                    )
                    .await?;

                self.event_logger
                    .log_best_effort(
                        BillingEventBuilder::new(user_id, BillingEventType::DowngradeScheduled)
                            .subscription(sub.id)
                            .actor_type(actor)
                            .data(serde_json::json!({
                                "new_plan_code": new_plan.code,
                                "effective_at": sub.ends_at.to_string(),
                            })),
                    )
                    .await;

                tracing::info!(
                    user_id = %user_id,
                    plan = %new_plan.code,
                    effective_at = %sub.ends_at,
                    "Downgrade scheduled"
                );
                Ok(updated)
            }
        }
    }

    /// Apply scheduled downgrades whose effective time has arrived.
    /// Worker entry point.
    pub async fn process_pending_changes(&self) -> BillingResult<u64> {
        let due: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUB_COLUMNS}
            FROM subscriptions
            WHERE status IN ('active', 'grace_period')
              AND pending_plan_id IS NOT NULL
              AND pending_change_at <= NOW()
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut applied = 0u64;
        for sub in due {
            let Some(new_plan_id) = sub.pending_plan_id else {
                continue;
            };
            match self
                .replace_plan(&sub, new_plan_id, BillingEventType::DowngradeApplied, ActorType::System)
                .await
            {
                Ok(_) => applied += 1,
                // A concurrent transition already moved this row; skip it.
                Err(BillingError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        if applied > 0 {
            tracing::info!(applied = applied, "Scheduled downgrades applied");
        }
        Ok(applied)
    }

    /// Advance every subscription the clock has moved past.
    pub async fn run_lifecycle_sweep(&self) -> BillingResult<SweepCounts> {
        let mut counts = SweepCounts::default();
        let now = OffsetDateTime::now_utc();

        // Active rows past their paid period: freemium plans roll over,
        // paid plans wait out a grace window for the renewal payment.
        let lapsed: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUB_COLUMNS}
            FROM subscriptions
            WHERE status = 'active' AND ends_at <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for sub in lapsed {
            // A retired plan must not stall the sweep for everyone else.
            let plan = self.catalog.get_plan_any_status(sub.plan_id).await?;
            let result = if plan.is_freemium {
                self.record_renewal(sub.id).await.map(|_| {
                    counts.renewed_freemium += 1;
                })
            } else if sub.auto_renew {
                self.enter_grace_period(sub.id).await.map(|_| {
                    counts.entered_grace += 1;
                })
            } else {
                // No renewal payment is coming; nothing to wait for.
                self.expire(sub.id).await.map(|_| {
                    counts.expired += 1;
                })
            };
            match result {
                Ok(()) => {}
                Err(BillingError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        // Grace windows that ran out.
        let graced_out: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUB_COLUMNS}
            FROM subscriptions
            WHERE status = 'grace_period' AND grace_ends_at <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for sub in graced_out {
            match self.expire(sub.id).await {
                Ok(_) => counts.expired += 1,
                Err(BillingError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        counts.downgrades_applied = self.process_pending_changes().await?;

        tracing::info!(
            renewed_freemium = counts.renewed_freemium,
            entered_grace = counts.entered_grace,
            expired = counts.expired,
            downgrades_applied = counts.downgrades_applied,
            "Lifecycle sweep complete"
        );

        Ok(counts)
    }

    /// Close a live row and open a new one on a different plan, linked via
    /// `previous_plan_id`, inside one transaction.
    async fn replace_plan(
        &self,
        sub: &Subscription,
        new_plan_id: Uuid,
        event: BillingEventType,
        actor: ActorType,
    ) -> BillingResult<Subscription> {
        let plan = self.catalog.get_plan(new_plan_id).await?;
        let now = OffsetDateTime::now_utc();
        let ends_at = now + plan.billing_cycle.period();

        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', pending_plan_id = NULL,
                pending_change_type = NULL, pending_change_at = NULL,
                updated_at = NOW(), version = version + 1
            WHERE id = $1 AND version = $2 AND status IN ('active', 'grace_period')
            "#,
        )
        .bind(sub.id)
        .bind(sub.version)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            return Err(BillingError::Conflict(format!(
                "Subscription {} was modified concurrently",
                sub.id
            )));
        }

        let replacement: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, started_at, ends_at, gateway,
                 external_reference, previous_plan_id)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
            RETURNING {SUB_COLUMNS}
            "#
        ))
        .bind(sub.user_id)
        .bind(new_plan_id)
        .bind(now)
        .bind(ends_at)
        .bind(sub.gateway.as_deref())
        .bind(sub.external_reference.as_deref())
        .bind(sub.plan_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.entitlements
            .reissue_entitlements(sub.user_id, new_plan_id)
            .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(sub.user_id, event)
                    .subscription(replacement.id)
                    .actor_type(actor)
                    .data(serde_json::json!({
                        "previous_plan_id": sub.plan_id.to_string(),
                        "new_plan_code": plan.code,
                    })),
            )
            .await;

        Ok(replacement)
    }

    /// Version-guarded single-row update. Returns the refreshed row or
    /// `Conflict` when another writer got there first.
    async fn versioned_update<'q, F>(
        &self,
        id: Uuid,
        version: i32,
        sql: &'q str,
        bind_extra: F,
    ) -> BillingResult<Subscription>
    where
        F: FnOnce(
            sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    {
        let query = bind_extra(sqlx::query(sql).bind(id).bind(version));
        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Conflict(format!(
                "Subscription {} was modified concurrently",
                id
            )));
        }

        self.get_subscription(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transitions() {
        use SubscriptionStatus::*;
        for from in [Expired, Cancelled] {
            for to in [Active, GracePeriod, Expired, Cancelled] {
                assert!(!transition_allowed(from, to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn grace_period_recovers_to_active() {
        assert!(transition_allowed(
            SubscriptionStatus::GracePeriod,
            SubscriptionStatus::Active
        ));
    }

    #[test]
    fn active_enters_grace_but_not_the_reverse_directly_to_itself() {
        assert!(transition_allowed(
            SubscriptionStatus::Active,
            SubscriptionStatus::GracePeriod
        ));
        assert!(!transition_allowed(
            SubscriptionStatus::Active,
            SubscriptionStatus::Active
        ));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::GracePeriod,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Cancelled,
        ] {
            let parsed = SubscriptionStatus::parse(status.as_str()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(SubscriptionStatus::parse("paused").is_err());
    }

    #[test]
    fn cancelled_subscription_grants_access_until_period_end() {
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: SubscriptionStatus::Cancelled,
            started_at: now - time::Duration::days(10),
            ends_at: now + time::Duration::days(20),
            auto_renew: false,
            grace_ends_at: None,
            cancelled_at: Some(now),
            gateway: None,
            external_reference: None,
            previous_plan_id: None,
            pending_plan_id: None,
            pending_change_type: None,
            pending_change_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        assert!(sub.grants_access(now));
        assert!(!sub.grants_access(now + time::Duration::days(21)));
    }
}
