//! Plan catalog
//!
//! Read-mostly lookup over plans, per-region/currency pricing and the
//! feature grants each plan carries. Constructed explicitly and passed to
//! callers; there is no global registry instance.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing cycle of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(BillingError::Validation(format!(
                "Unknown billing cycle '{}'",
                other
            ))),
        }
    }

    /// Nominal length of one billing period.
    pub fn period(&self) -> time::Duration {
        match self {
            BillingCycle::Monthly => time::Duration::days(30),
            BillingCycle::Yearly => time::Duration::days(365),
        }
    }
}

/// How a plan limits a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// No cap, no counter mutation
    Unlimited,
    /// Capped at `limit_value`, metered per use
    Count,
    /// On/off switch, no counter mutation
    Boolean,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Unlimited => "unlimited",
            LimitType::Count => "count",
            LimitType::Boolean => "boolean",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "unlimited" => Ok(LimitType::Unlimited),
            "count" => Ok(LimitType::Count),
            "boolean" => Ok(LimitType::Boolean),
            other => Err(BillingError::Validation(format!(
                "Unknown limit type '{}'",
                other
            ))),
        }
    }
}

/// How often a countable feature's usage counter resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetFrequency {
    Never,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl ResetFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetFrequency::Never => "never",
            ResetFrequency::Daily => "daily",
            ResetFrequency::Weekly => "weekly",
            ResetFrequency::Monthly => "monthly",
            ResetFrequency::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "never" => Ok(ResetFrequency::Never),
            "daily" => Ok(ResetFrequency::Daily),
            "weekly" => Ok(ResetFrequency::Weekly),
            "monthly" => Ok(ResetFrequency::Monthly),
            "yearly" => Ok(ResetFrequency::Yearly),
            other => Err(BillingError::Validation(format!(
                "Unknown reset frequency '{}'",
                other
            ))),
        }
    }

    /// Next reset instant, strictly after `now`. `None` for `Never`.
    pub fn next_reset(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let duration = match self {
            ResetFrequency::Never => return None,
            ResetFrequency::Daily => time::Duration::days(1),
            ResetFrequency::Weekly => time::Duration::days(7),
            ResetFrequency::Monthly => time::Duration::days(30),
            ResetFrequency::Yearly => time::Duration::days(365),
        };
        Some(now + duration)
    }
}

/// A subscription plan
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub billing_cycle: BillingCycle,
    pub is_freemium: bool,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Plan {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let cycle: String = row.try_get("billing_cycle")?;
        Ok(Self {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            billing_cycle: BillingCycle::parse(&cycle)
                .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
            is_freemium: row.try_get("is_freemium")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Price of a plan in one (region, currency) pair.
///
/// `tax_inclusive` marks whether the listed price already contains the tax
/// component (e.g. GST-region pricing). It is an explicit modeled flag, not
/// inferred from the region.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanPricing {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub region: String,
    pub currency: String,
    pub price: Decimal,
    pub tax_inclusive: bool,
}

/// A feature joined with its per-plan limit row
#[derive(Debug, Clone, Serialize)]
pub struct PlanFeatureView {
    pub feature_id: Uuid,
    pub feature_code: String,
    pub feature_name: String,
    pub limit_type: LimitType,
    pub limit_value: Option<i64>,
    pub is_enabled: bool,
    pub reset_frequency: ResetFrequency,
    pub is_countable: bool,
    pub is_token_metered: bool,
    pub cost_factor: Decimal,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PlanFeatureView {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let limit_type: String = row.try_get("limit_type")?;
        let reset_frequency: String = row.try_get("reset_frequency")?;
        Ok(Self {
            feature_id: row.try_get("feature_id")?,
            feature_code: row.try_get("feature_code")?,
            feature_name: row.try_get("feature_name")?,
            limit_type: LimitType::parse(&limit_type)
                .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
            limit_value: row.try_get("limit_value")?,
            is_enabled: row.try_get("is_enabled")?,
            reset_frequency: ResetFrequency::parse(&reset_frequency)
                .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
            is_countable: row.try_get("is_countable")?,
            is_token_metered: row.try_get("is_token_metered")?,
            cost_factor: row.try_get("cost_factor")?,
        })
    }
}

/// Plan catalog service
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up an active plan by id.
    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, billing_cycle, is_freemium, is_active, created_at
            FROM plans
            WHERE id = $1 AND is_active = true
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    /// Look up a plan by id regardless of its active flag.
    ///
    /// Lifecycle paths use this for plans existing subscribers already
    /// hold: retiring a plan stops new purchases, never the subscriptions
    /// already running on it.
    pub async fn get_plan_any_status(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, billing_cycle, is_freemium, is_active, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    /// Look up an active plan by its stable code.
    pub async fn get_plan_by_code(&self, code: &str) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, billing_cycle, is_freemium, is_active, created_at
            FROM plans
            WHERE code = $1 AND is_active = true
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan '{}' not found", code)))
    }

    /// Price of a plan for a (region, currency) pair.
    ///
    /// A plan with no pricing row for the pair cannot be purchased there.
    pub async fn get_pricing(
        &self,
        plan_id: Uuid,
        region: &str,
        currency: &str,
    ) -> BillingResult<PlanPricing> {
        let pricing: Option<PlanPricing> = sqlx::query_as(
            r#"
            SELECT id, plan_id, region, currency, price, tax_inclusive
            FROM plan_pricing
            WHERE plan_id = $1 AND region = $2 AND currency = $3
            "#,
        )
        .bind(plan_id)
        .bind(region)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;

        pricing.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No pricing for plan {} in {}/{}",
                plan_id, region, currency
            ))
        })
    }

    /// All feature grants carried by a plan.
    pub async fn features_for_plan(&self, plan_id: Uuid) -> BillingResult<Vec<PlanFeatureView>> {
        let features: Vec<PlanFeatureView> = sqlx::query_as(
            r#"
            SELECT
                f.id as feature_id,
                f.code as feature_code,
                f.name as feature_name,
                pf.limit_type,
                pf.limit_value,
                pf.is_enabled,
                pf.reset_frequency,
                f.is_countable,
                f.is_token_metered,
                f.cost_factor
            FROM plan_features pf
            JOIN features f ON f.id = pf.feature_id
            WHERE pf.plan_id = $1
            ORDER BY f.code
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(features)
    }

    /// One feature grant on a plan, by feature code.
    pub async fn plan_feature(
        &self,
        plan_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<PlanFeatureView> {
        let feature: Option<PlanFeatureView> = sqlx::query_as(
            r#"
            SELECT
                f.id as feature_id,
                f.code as feature_code,
                f.name as feature_name,
                pf.limit_type,
                pf.limit_value,
                pf.is_enabled,
                pf.reset_frequency,
                f.is_countable,
                f.is_token_metered,
                f.cost_factor
            FROM plan_features pf
            JOIN features f ON f.id = pf.feature_id
            WHERE pf.plan_id = $1 AND f.code = $2
            "#,
        )
        .bind(plan_id)
        .bind(feature_code)
        .fetch_optional(&self.pool)
        .await?;

        feature.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Feature '{}' not granted by plan {}",
                feature_code, plan_id
            ))
        })
    }

    /// Pricing row for a plan by currency alone, for webhook payloads that
    /// carry no region.
    pub async fn pricing_for_currency(
        &self,
        plan_id: Uuid,
        currency: &str,
    ) -> BillingResult<PlanPricing> {
        let pricing: Option<PlanPricing> = sqlx::query_as(
            r#"
            SELECT id, plan_id, region, currency, price, tax_inclusive
            FROM plan_pricing
            WHERE plan_id = $1 AND currency = $2
            ORDER BY region
            LIMIT 1
            "#,
        )
        .bind(plan_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;

        pricing.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No pricing for plan {} in currency {}",
                plan_id, currency
            ))
        })
    }

    /// The freemium fallback plan, if the catalog defines one.
    pub async fn freemium_plan(&self) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, billing_cycle, is_freemium, is_active, created_at
            FROM plans
            WHERE is_freemium = true AND is_active = true
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// Active plans with their pricing rows for one region, for admin views
    /// and purchase pages.
    pub async fn list_active_plans(
        &self,
        region: &str,
    ) -> BillingResult<Vec<(Plan, Vec<PlanPricing>)>> {
        let plans: Vec<Plan> = sqlx::query_as(
            r#"
            SELECT id, code, name, billing_cycle, is_freemium, is_active, created_at
            FROM plans
            WHERE is_active = true
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(plans.len());
        for plan in plans {
            let pricing: Vec<PlanPricing> = sqlx::query_as(
                r#"
                SELECT id, plan_id, region, currency, price, tax_inclusive
                FROM plan_pricing
                WHERE plan_id = $1 AND region = $2
                ORDER BY currency
                "#,
            )
            .bind(plan.id)
            .bind(region)
            .fetch_all(&self.pool)
            .await?;
            result.push((plan, pricing));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_cycle_round_trip() {
        assert_eq!(BillingCycle::parse("monthly").unwrap(), BillingCycle::Monthly);
        assert_eq!(BillingCycle::parse("yearly").unwrap(), BillingCycle::Yearly);
        assert!(BillingCycle::parse("weekly").is_err());
        assert_eq!(BillingCycle::Monthly.as_str(), "monthly");
    }

    #[test]
    fn test_limit_type_parse() {
        assert_eq!(LimitType::parse("count").unwrap(), LimitType::Count);
        assert_eq!(LimitType::parse("unlimited").unwrap(), LimitType::Unlimited);
        assert_eq!(LimitType::parse("boolean").unwrap(), LimitType::Boolean);
        assert!(LimitType::parse("metered").is_err());
    }

    #[test]
    fn test_next_reset_is_strictly_after_now() {
        let now = OffsetDateTime::now_utc();

        assert!(ResetFrequency::Never.next_reset(now).is_none());

        for freq in [
            ResetFrequency::Daily,
            ResetFrequency::Weekly,
            ResetFrequency::Monthly,
            ResetFrequency::Yearly,
        ] {
            let next = freq.next_reset(now).unwrap();
            assert!(next > now, "{:?} reset should be after now", freq);
        }
    }

    #[test]
    fn test_reset_intervals_ordered() {
        let now = OffsetDateTime::now_utc();
        let daily = ResetFrequency::Daily.next_reset(now).unwrap();
        let weekly = ResetFrequency::Weekly.next_reset(now).unwrap();
        let monthly = ResetFrequency::Monthly.next_reset(now).unwrap();
        let yearly = ResetFrequency::Yearly.next_reset(now).unwrap();
        assert!(daily < weekly && weekly < monthly && monthly < yearly);
    }
}
