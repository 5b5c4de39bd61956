//! Entitlement ledger
//!
//! Answers "can this user perform action X right now" and meters usage.
//! The count path is a single conditional upsert so two concurrent requests
//! for the same user can never both pass the limit check.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{LimitType, PlanCatalog, PlanFeatureView, ResetFrequency};
use crate::error::{BillingError, BillingResult};

/// Outcome of a successful entitlement check
#[derive(Debug, Clone, Serialize)]
pub struct Consumption {
    pub allowed: bool,
    /// Remaining uses after this consumption; `None` for unlimited/boolean
    pub remaining: Option<i64>,
}

/// One row of a user's usage snapshot, for display
#[derive(Debug, Clone, Serialize)]
pub struct FeatureUsageView {
    pub feature_code: String,
    pub feature_name: String,
    pub limit_type: LimitType,
    pub used: i64,
    pub limit: Option<i64>,
    pub is_enabled: bool,
    pub resets_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    feature_id: Uuid,
    usage_count: i64,
    reset_at: Option<OffsetDateTime>,
}

/// Entitlement ledger service
#[derive(Clone)]
pub struct EntitlementLedger {
    pool: PgPool,
    catalog: PlanCatalog,
}

impl EntitlementLedger {
    pub fn new(pool: PgPool, catalog: PlanCatalog) -> Self {
        Self { pool, catalog }
    }

    /// Plan of the user's current subscription, if access is live.
    ///
    /// Access is live while the subscription is ACTIVE, in GRACE_PERIOD, or
    /// CANCELLED with a paid period that has not ended yet.
    async fn resolve_current_plan(&self, user_id: Uuid) -> BillingResult<Uuid> {
        let plan: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT plan_id
            FROM subscriptions
            WHERE user_id = $1
              AND (
                  status IN ('active', 'grace_period')
                  OR (status = 'cancelled' AND ends_at > NOW())
              )
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.map(|(id,)| id)
            .ok_or_else(|| BillingError::NotFound(format!("No live subscription for user {}", user_id)))
    }

    /// Check whether the user may perform `amount` uses of a feature and,
    /// for count-limited features, consume them.
    ///
    /// The increment-and-check is one conditional upsert; on conflict the
    /// `WHERE` guard rejects the update when the limit would be exceeded,
    /// so concurrent calls serialize at the row and usage never passes the
    /// limit.
    pub async fn check_and_consume(
        &self,
        user_id: Uuid,
        feature_code: &str,
        amount: i64,
    ) -> BillingResult<Consumption> {
        if amount <= 0 {
            return Err(BillingError::Validation(format!(
                "Consumption amount must be positive, got {}",
                amount
            )));
        }

        let plan_id = self.resolve_current_plan(user_id).await?;
        let grant = self.catalog.plan_feature(plan_id, feature_code).await?;

        match grant.limit_type {
            LimitType::Unlimited => Ok(Consumption {
                allowed: true,
                remaining: None,
            }),
            LimitType::Boolean => {
                if grant.is_enabled {
                    Ok(Consumption {
                        allowed: true,
                        remaining: None,
                    })
                } else {
                    Err(BillingError::limit_exceeded(feature_code, 0, 0))
                }
            }
            LimitType::Count => {
                let limit = grant.limit_value.ok_or_else(|| {
                    BillingError::InvariantViolation(format!(
                        "Count-limited feature '{}' on plan {} has no limit value",
                        feature_code, plan_id
                    ))
                })?;
                if !grant.is_enabled {
                    return Err(BillingError::limit_exceeded(feature_code, 0, limit));
                }
                self.consume_counted(user_id, &grant, amount, limit).await
            }
        }
    }

    async fn consume_counted(
        &self,
        user_id: Uuid,
        grant: &PlanFeatureView,
        amount: i64,
        limit: i64,
    ) -> BillingResult<Consumption> {
        let now = OffsetDateTime::now_utc();

        // Reset a lapsed window before the check. Guarded on reset_at so a
        // concurrent reset applies once.
        if let Some(next) = grant.reset_frequency.next_reset(now) {
            sqlx::query(
                r#"
                UPDATE feature_usage
                SET usage_count = 0, reset_at = $3
                WHERE user_id = $1 AND feature_id = $2
                  AND reset_at IS NOT NULL AND reset_at < NOW()
                "#,
            )
            .bind(user_id)
            .bind(grant.feature_id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        }

        if amount > limit {
            let used = self.current_usage(user_id, grant.feature_id).await?;
            return Err(BillingError::limit_exceeded(
                grant.feature_code.as_str(),
                used,
                limit,
            ));
        }

        let token_cost = if grant.is_token_metered {
            Some(grant.cost_factor * Decimal::from(amount))
        } else {
            None
        };

        let initial_reset = grant.reset_frequency.next_reset(now);

        // Atomic increment-with-check. The insert arm covers first use
        // (amount <= limit verified above); the update arm only applies
        // when the new count stays within the limit.
        let consumed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO feature_usage
                (user_id, feature_id, usage_count, reset_at, last_used_at, token_cost)
            VALUES ($1, $2, $3, $4, NOW(), $6)
            ON CONFLICT (user_id, feature_id) DO UPDATE
            SET usage_count = feature_usage.usage_count + $3,
                last_used_at = NOW(),
                token_cost = COALESCE(feature_usage.token_cost, 0) + COALESCE($6, 0)
            WHERE feature_usage.usage_count + $3 <= $5
            RETURNING usage_count
            "#,
        )
        .bind(user_id)
        .bind(grant.feature_id)
        .bind(amount)
        .bind(initial_reset)
        .bind(limit)
        .bind(token_cost)
        .fetch_optional(&self.pool)
        .await?;

        match consumed {
            Some((count,)) => {
                tracing::debug!(
                    user_id = %user_id,
                    feature = %grant.feature_code,
                    used = count,
                    limit = limit,
                    "Entitlement consumed"
                );
                Ok(Consumption {
                    allowed: true,
                    remaining: Some(limit - count),
                })
            }
            None => {
                let used = self.current_usage(user_id, grant.feature_id).await?;
                Err(BillingError::limit_exceeded(
                    grant.feature_code.as_str(),
                    used,
                    limit,
                ))
            }
        }
    }

    async fn current_usage(&self, user_id: Uuid, feature_id: Uuid) -> BillingResult<i64> {
        let current: Option<(i64,)> = sqlx::query_as(
            "SELECT usage_count FROM feature_usage WHERE user_id = $1 AND feature_id = $2",
        )
        .bind(user_id)
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(current.map(|(c,)| c).unwrap_or(0))
    }

    /// Read-only usage snapshot over the user's current plan.
    pub async fn usage_snapshot(&self, user_id: Uuid) -> BillingResult<Vec<FeatureUsageView>> {
        let plan_id = self.resolve_current_plan(user_id).await?;
        let grants = self.catalog.features_for_plan(plan_id).await?;

        let usage: Vec<UsageRow> = sqlx::query_as(
            r#"
            SELECT feature_id, usage_count, reset_at
            FROM feature_usage
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let snapshot = grants
            .into_iter()
            .map(|grant| {
                let row = usage.iter().find(|u| u.feature_id == grant.feature_id);
                FeatureUsageView {
                    used: row.map(|u| u.usage_count).unwrap_or(0),
                    resets_at: row.and_then(|u| u.reset_at),
                    limit: grant.limit_value,
                    feature_code: grant.feature_code,
                    feature_name: grant.feature_name,
                    limit_type: grant.limit_type,
                    is_enabled: grant.is_enabled,
                }
            })
            .collect();

        Ok(snapshot)
    }

    /// Re-derive usage rows from a plan's feature grants after a lifecycle
    /// transition.
    ///
    /// Accumulated counts carry over; only a lapsed (or absent) reset
    /// window is re-seeded from the new plan's cadence.
    pub async fn reissue_entitlements(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<()> {
        let grants = self.catalog.features_for_plan(plan_id).await?;
        let now = OffsetDateTime::now_utc();

        for grant in grants.iter().filter(|g| g.limit_type == LimitType::Count) {
            let next = grant.reset_frequency.next_reset(now);
            sqlx::query(
                r#"
                INSERT INTO feature_usage (user_id, feature_id, usage_count, reset_at)
                VALUES ($1, $2, 0, $3)
                ON CONFLICT (user_id, feature_id) DO UPDATE
                SET usage_count = CASE
                        WHEN feature_usage.reset_at IS NOT NULL AND feature_usage.reset_at < NOW()
                        THEN 0
                        ELSE feature_usage.usage_count
                    END,
                    reset_at = CASE
                        WHEN feature_usage.reset_at IS NULL
                          OR feature_usage.reset_at < NOW()
                        THEN EXCLUDED.reset_at
                        ELSE feature_usage.reset_at
                    END
                "#,
            )
            .bind(user_id)
            .bind(grant.feature_id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            features = grants.len(),
            "Entitlements reissued"
        );

        Ok(())
    }

    /// Reset every lapsed counter. Worker entry point.
    ///
    /// Each row is re-armed with the cadence of the owning user's current
    /// plan; rows whose plan no longer grants the feature keep their lapsed
    /// window and reset on next use instead.
    pub async fn reset_lapsed_counters(&self) -> BillingResult<u64> {
        let lapsed: Vec<(Uuid, Uuid, String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT fu.user_id, fu.feature_id, pf.reset_frequency, fu.reset_at
            FROM feature_usage fu
            JOIN subscriptions s ON s.user_id = fu.user_id
                AND (s.status IN ('active', 'grace_period')
                     OR (s.status = 'cancelled' AND s.ends_at > NOW()))
            JOIN plan_features pf ON pf.plan_id = s.plan_id AND pf.feature_id = fu.feature_id
            WHERE fu.reset_at IS NOT NULL AND fu.reset_at < NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        let mut reset = 0u64;

        for (user_id, feature_id, frequency, old_reset) in lapsed {
            let next = ResetFrequency::parse(&frequency)?.next_reset(now);
            // Guard on the old reset_at so a concurrent consumer's reset
            // applies once.
            let result = sqlx::query(
                r#"
                UPDATE feature_usage
                SET usage_count = 0, reset_at = $4
                WHERE user_id = $1 AND feature_id = $2 AND reset_at = $3
                "#,
            )
            .bind(user_id)
            .bind(feature_id)
            .bind(old_reset)
            .bind(next)
            .execute(&self.pool)
            .await?;
            reset += result.rows_affected();
        }

        if reset > 0 {
            tracing::info!(reset = reset, "Lapsed usage counters reset");
        }

        Ok(reset)
    }
}
