//! Tax and invoice calculation
//!
//! Decomposes plan prices into subtotal/tax/total per region and issues
//! invoices with a frozen snapshot of every input, so later changes to tax
//! settings or billing details never alter a historical invoice.
//!
//! All monetary math is fixed-point `Decimal`; tax rounding is half-up to
//! two decimal places.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanPricing;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// An enabled tax rule for one (region, currency) pair
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaxSetting {
    pub id: Uuid,
    pub region: String,
    pub currency: String,
    pub tax_label: String,
    pub rate_percent: Decimal,
    pub is_enabled: bool,
}

/// Subtotal / tax / total decomposition of a price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub subtotal: Decimal,
    pub tax_rate_percent: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl TaxBreakdown {
    /// A zero-tax breakdown for regions with no enabled tax setting.
    pub fn untaxed(price: Decimal) -> Self {
        let total = round_money(price);
        Self {
            subtotal: total,
            tax_rate_percent: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total,
        }
    }
}

/// An issued invoice. Immutable once written.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub invoice_number: String,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub region: String,
    pub tax_label: String,
    pub tax_inclusive: bool,
    pub billing_snapshot: serde_json::Value,
    pub issued_at: OffsetDateTime,
}

/// Round to two decimal places, half-up.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Decompose a price into subtotal, tax and total.
///
/// For a tax-inclusive price the subtotal is derived backward
/// (`price / (1 + rate)`) and the tax is the residual, so the components
/// always sum to the listed price exactly. For an exclusive price the tax
/// is added forward.
pub fn compute_breakdown(
    price: Decimal,
    rate_percent: Decimal,
    tax_inclusive: bool,
) -> BillingResult<TaxBreakdown> {
    if rate_percent < Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "Negative tax rate: {}",
            rate_percent
        )));
    }
    if price < Decimal::ZERO {
        return Err(BillingError::Validation(format!(
            "Negative price: {}",
            price
        )));
    }

    let rate = rate_percent / Decimal::ONE_HUNDRED;

    let breakdown = if tax_inclusive {
        let total = round_money(price);
        let subtotal = round_money(total / (Decimal::ONE + rate));
        TaxBreakdown {
            subtotal,
            tax_rate_percent: rate_percent,
            tax_amount: total - subtotal,
            total,
        }
    } else {
        let subtotal = round_money(price);
        let tax_amount = round_money(subtotal * rate);
        TaxBreakdown {
            subtotal,
            tax_rate_percent: rate_percent,
            tax_amount,
            total: subtotal + tax_amount,
        }
    };

    Ok(breakdown)
}

/// Tax and invoice service
#[derive(Clone)]
pub struct TaxService {
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl TaxService {
    pub fn new(pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self { pool, event_logger }
    }

    /// The enabled tax setting for a (region, currency) pair, if any.
    pub async fn enabled_setting(
        &self,
        region: &str,
        currency: &str,
    ) -> BillingResult<Option<TaxSetting>> {
        let setting: Option<TaxSetting> = sqlx::query_as(
            r#"
            SELECT id, region, currency, tax_label, rate_percent, is_enabled
            FROM tax_settings
            WHERE region = $1 AND currency = $2 AND is_enabled = true
            "#,
        )
        .bind(region)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;

        Ok(setting)
    }

    /// Breakdown for a pricing row, applying the region's enabled tax
    /// setting if one exists.
    pub async fn breakdown_for_pricing(
        &self,
        pricing: &PlanPricing,
    ) -> BillingResult<TaxBreakdown> {
        match self
            .enabled_setting(&pricing.region, &pricing.currency)
            .await?
        {
            Some(setting) => {
                compute_breakdown(pricing.price, setting.rate_percent, pricing.tax_inclusive)
            }
            None => Ok(TaxBreakdown::untaxed(pricing.price)),
        }
    }

    /// Issue an invoice for a paid subscription period.
    ///
    /// The billing/company/tax inputs are frozen into `billing_snapshot`
    /// at issuance; there is no update path for this table.
    pub async fn issue_invoice(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        transaction_id: Option<Uuid>,
        pricing: &PlanPricing,
        billing_details: serde_json::Value,
    ) -> BillingResult<Invoice> {
        let setting = self
            .enabled_setting(&pricing.region, &pricing.currency)
            .await?;

        let (breakdown, tax_label) = match &setting {
            Some(s) => (
                compute_breakdown(pricing.price, s.rate_percent, pricing.tax_inclusive)?,
                s.tax_label.clone(),
            ),
            None => (TaxBreakdown::untaxed(pricing.price), String::new()),
        };

        let seq: (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        let invoice_number = format!("INV-{:08}", seq.0);

        let snapshot = serde_json::json!({
            "billing_details": billing_details,
            "listed_price": pricing.price,
            "tax_inclusive": pricing.tax_inclusive,
            "tax_rate_percent": breakdown.tax_rate_percent,
            "tax_label": tax_label,
            "region": pricing.region,
            "currency": pricing.currency,
        });

        let invoice: Invoice = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                user_id, subscription_id, transaction_id, invoice_number,
                subtotal, tax_rate, tax_amount, total,
                currency, region, tax_label, tax_inclusive, billing_snapshot
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, user_id, subscription_id, transaction_id, invoice_number,
                      subtotal, tax_rate, tax_amount, total,
                      currency, region, tax_label, tax_inclusive, billing_snapshot, issued_at
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(transaction_id)
        .bind(&invoice_number)
        .bind(breakdown.subtotal)
        .bind(breakdown.tax_rate_percent)
        .bind(breakdown.tax_amount)
        .bind(breakdown.total)
        .bind(&pricing.currency)
        .bind(&pricing.region)
        .bind(&tax_label)
        .bind(pricing.tax_inclusive)
        .bind(&snapshot)
        .fetch_one(&self.pool)
        .await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::InvoiceIssued)
                    .subscription(subscription_id)
                    .data(serde_json::json!({
                        "invoice_number": invoice.invoice_number,
                        "total": invoice.total,
                        "currency": invoice.currency,
                    })),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            currency = %invoice.currency,
            "Invoice issued"
        );

        Ok(invoice)
    }

    /// Invoices for a user, newest first.
    pub async fn invoices_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let invoices: Vec<Invoice> = sqlx::query_as(
            r#"
            SELECT id, user_id, subscription_id, transaction_id, invoice_number,
                   subtotal, tax_rate, tax_amount, total,
                   currency, region, tax_label, tax_inclusive, billing_snapshot, issued_at
            FROM invoices
            WHERE user_id = $1
            ORDER BY issued_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_inclusive_gst_decomposition() {
        // 1000 INR listed price, 18% GST already included:
        // subtotal 847.46, tax 152.54, total 1000.00
        let b = compute_breakdown(dec!(1000), dec!(18), true).unwrap();
        assert_eq!(b.subtotal, dec!(847.46));
        assert_eq!(b.tax_amount, dec!(152.54));
        assert_eq!(b.total, dec!(1000.00));
    }

    #[test]
    fn test_inclusive_components_sum_to_total() {
        for price in [dec!(1), dec!(99.99), dec!(499), dec!(1000), dec!(12345.67)] {
            let b = compute_breakdown(price, dec!(18), true).unwrap();
            assert_eq!(b.subtotal + b.tax_amount, b.total, "price {}", price);
        }
    }

    #[test]
    fn test_exclusive_adds_tax_forward() {
        let b = compute_breakdown(dec!(100), dec!(18), false).unwrap();
        assert_eq!(b.subtotal, dec!(100.00));
        assert_eq!(b.tax_amount, dec!(18.00));
        assert_eq!(b.total, dec!(118.00));
    }

    #[test]
    fn test_half_up_rounding() {
        // 10 / 1.18 = 8.47457... -> 8.47; tax = 1.53
        let b = compute_breakdown(dec!(10), dec!(18), true).unwrap();
        assert_eq!(b.subtotal, dec!(8.47));
        assert_eq!(b.tax_amount, dec!(1.53));

        // Exclusive: 8.475 rounds half-up to 8.48
        let b = compute_breakdown(dec!(84.75), dec!(10), false).unwrap();
        assert_eq!(b.tax_amount, dec!(8.48));
    }

    #[test]
    fn test_zero_rate_means_no_tax() {
        let b = compute_breakdown(dec!(500), dec!(0), true).unwrap();
        assert_eq!(b.subtotal, dec!(500.00));
        assert_eq!(b.tax_amount, dec!(0.00));
        assert_eq!(b.total, dec!(500.00));
    }

    #[test]
    fn test_untaxed_breakdown() {
        let b = TaxBreakdown::untaxed(dec!(9.99));
        assert_eq!(b.subtotal, dec!(9.99));
        assert_eq!(b.tax_amount, Decimal::ZERO);
        assert_eq!(b.total, dec!(9.99));
    }

    #[test]
    fn test_negative_inputs_rejected() {
        assert!(compute_breakdown(dec!(-1), dec!(18), true).is_err());
        assert!(compute_breakdown(dec!(100), dec!(-5), false).is_err());
    }

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(dec!(152.535)), dec!(152.54));
        assert_eq!(round_money(dec!(152.534)), dec!(152.53));
        assert_eq!(round_money(dec!(0.005)), dec!(0.01));
    }
}
