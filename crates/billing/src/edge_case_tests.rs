//! Edge case tests for the billing engine's pure logic: money math,
//! refund bounds, state machine edges, reset windows, and webhook
//! payload handling. Database-backed paths are exercised by their own
//! modules' tests and the staging invariant runs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::ResetFrequency;
use crate::error::{validate_amount, BillingError};
use crate::gateway::{normalize_legacy_mapping, GatewayKind};
use crate::payments::{validate_refund, Transaction, TransactionStatus};
use crate::subscriptions::{transition_allowed, SubscriptionStatus};
use crate::tax::{compute_breakdown, round_money};
use crate::webhooks::WebhookEventType;

// ============================================================
// Tax decomposition
// ============================================================

#[test]
fn inclusive_1000_inr_at_18_percent_gst() {
    let breakdown = compute_breakdown(dec!(1000.00), dec!(18), true).unwrap();
    assert_eq!(breakdown.subtotal, dec!(847.46));
    assert_eq!(breakdown.tax_amount, dec!(152.54));
    assert_eq!(breakdown.total, dec!(1000.00));
}

#[test]
fn inclusive_components_always_sum_to_the_listed_price() {
    let prices = [
        dec!(1.00),
        dec!(9.99),
        dec!(100.00),
        dec!(499.00),
        dec!(1000.00),
        dec!(12345.67),
    ];
    let rates = [dec!(0), dec!(5), dec!(12), dec!(18), dec!(28)];

    for price in prices {
        for rate in rates {
            let b = compute_breakdown(price, rate, true).unwrap();
            assert_eq!(
                b.subtotal + b.tax_amount,
                b.total,
                "price {} rate {}",
                price,
                rate
            );
            assert_eq!(b.total, price, "inclusive total must equal listed price");
        }
    }
}

#[test]
fn exclusive_prices_add_tax_forward() {
    let b = compute_breakdown(dec!(100.00), dec!(18), false).unwrap();
    assert_eq!(b.subtotal, dec!(100.00));
    assert_eq!(b.tax_amount, dec!(18.00));
    assert_eq!(b.total, dec!(118.00));
}

#[test]
fn zero_rate_collapses_to_the_price_itself() {
    for inclusive in [true, false] {
        let b = compute_breakdown(dec!(250.00), dec!(0), inclusive).unwrap();
        assert_eq!(b.subtotal, dec!(250.00));
        assert_eq!(b.tax_amount, dec!(0.00));
        assert_eq!(b.total, dec!(250.00));
    }
}

#[test]
fn money_rounds_half_up_at_two_decimal_places() {
    assert_eq!(round_money(dec!(1.005)), dec!(1.01));
    assert_eq!(round_money(dec!(1.004)), dec!(1.00));
    assert_eq!(round_money(dec!(2.675)), dec!(2.68));
    assert_eq!(round_money(dec!(847.4576)), dec!(847.46));
}

#[test]
fn negative_prices_and_rates_are_rejected() {
    assert!(compute_breakdown(dec!(-1), dec!(18), true).is_err());
    assert!(compute_breakdown(dec!(100), dec!(-5), false).is_err());
}

// ============================================================
// Money validation
// ============================================================

#[test]
fn amounts_must_be_positive_two_decimal_money() {
    assert!(validate_amount(dec!(0.01)).is_ok());
    assert!(validate_amount(dec!(1000)).is_ok());
    assert!(validate_amount(Decimal::ZERO).is_err());
    assert!(validate_amount(dec!(-10)).is_err());
    assert!(validate_amount(dec!(0.001)).is_err());
}

// ============================================================
// Refund bounds
// ============================================================

fn txn(amount: Decimal, refunded: Decimal, status: TransactionStatus) -> Transaction {
    let now = OffsetDateTime::now_utc();
    Transaction {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        subscription_id: None,
        amount,
        currency: "INR".to_string(),
        gateway: GatewayKind::Razorpay,
        external_transaction_id: "pay_edge".to_string(),
        status,
        refunded_amount: refunded,
        refund_reason: None,
        refunded_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[test]
fn partial_refunds_accumulate_up_to_but_never_past_the_original() {
    let half_refunded = txn(dec!(1000.00), dec!(500.00), TransactionStatus::Completed);
    assert!(validate_refund(&half_refunded, dec!(500.00)).is_ok());
    assert!(validate_refund(&half_refunded, dec!(500.01)).is_err());
}

#[test]
fn exact_full_refund_is_the_boundary_case_that_passes() {
    let fresh = txn(dec!(299.00), dec!(0), TransactionStatus::Completed);
    assert!(validate_refund(&fresh, dec!(299.00)).is_ok());
}

#[test]
fn refunds_against_non_settled_money_are_conflicts() {
    let pending = txn(dec!(100.00), dec!(0), TransactionStatus::Pending);
    assert!(matches!(
        validate_refund(&pending, dec!(10.00)),
        Err(BillingError::Conflict(_))
    ));
}

// ============================================================
// Lifecycle state machine
// ============================================================

#[test]
fn the_lapse_path_active_grace_expired_is_a_one_way_street() {
    assert!(transition_allowed(
        SubscriptionStatus::Active,
        SubscriptionStatus::GracePeriod
    ));
    assert!(transition_allowed(
        SubscriptionStatus::GracePeriod,
        SubscriptionStatus::Expired
    ));
    // Expired never comes back by transition; recovery is a new purchase.
    assert!(!transition_allowed(
        SubscriptionStatus::Expired,
        SubscriptionStatus::Active
    ));
    assert!(!transition_allowed(
        SubscriptionStatus::Expired,
        SubscriptionStatus::GracePeriod
    ));
}

#[test]
fn cancellation_is_reachable_from_both_live_states_only() {
    assert!(transition_allowed(
        SubscriptionStatus::Active,
        SubscriptionStatus::Cancelled
    ));
    assert!(transition_allowed(
        SubscriptionStatus::GracePeriod,
        SubscriptionStatus::Cancelled
    ));
    assert!(!transition_allowed(
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Active
    ));
    assert!(!transition_allowed(
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired
    ));
}

// ============================================================
// Usage reset windows
// ============================================================

#[test]
fn reset_windows_land_strictly_in_the_future() {
    let now = OffsetDateTime::now_utc();
    for freq in [
        ResetFrequency::Daily,
        ResetFrequency::Weekly,
        ResetFrequency::Monthly,
        ResetFrequency::Yearly,
    ] {
        let next = freq.next_reset(now).unwrap();
        assert!(next > now, "{:?} reset must be after now", freq);
    }
    assert!(ResetFrequency::Never.next_reset(now).is_none());
}

#[test]
fn reset_window_ordering_matches_cadence() {
    let now = OffsetDateTime::now_utc();
    let daily = ResetFrequency::Daily.next_reset(now).unwrap();
    let weekly = ResetFrequency::Weekly.next_reset(now).unwrap();
    let monthly = ResetFrequency::Monthly.next_reset(now).unwrap();
    let yearly = ResetFrequency::Yearly.next_reset(now).unwrap();
    assert!(daily < weekly && weekly < monthly && monthly < yearly);
}

// ============================================================
// Webhook event taxonomy
// ============================================================

#[test]
fn both_gateways_converge_on_the_neutral_event_types() {
    let pairs = [
        (
            WebhookEventType::normalize(GatewayKind::Razorpay, "payment.captured"),
            WebhookEventType::normalize(GatewayKind::Paypal, "PAYMENT.CAPTURE.COMPLETED"),
        ),
        (
            WebhookEventType::normalize(GatewayKind::Razorpay, "payment.failed"),
            WebhookEventType::normalize(GatewayKind::Paypal, "PAYMENT.CAPTURE.DENIED"),
        ),
        (
            WebhookEventType::normalize(GatewayKind::Razorpay, "subscription.cancelled"),
            WebhookEventType::normalize(GatewayKind::Paypal, "BILLING.SUBSCRIPTION.CANCELLED"),
        ),
        (
            WebhookEventType::normalize(GatewayKind::Razorpay, "refund.processed"),
            WebhookEventType::normalize(GatewayKind::Paypal, "PAYMENT.CAPTURE.REFUNDED"),
        ),
    ];
    for (razorpay, paypal) in pairs {
        assert_eq!(razorpay, paypal);
    }
}

#[test]
fn unknown_event_types_are_classified_not_errored() {
    let unknown = WebhookEventType::normalize(GatewayKind::Razorpay, "settlement.processed");
    assert_eq!(
        unknown,
        WebhookEventType::Unknown("settlement.processed".to_string())
    );
}

// ============================================================
// Legacy plan mapping normalization
// ============================================================

#[test]
fn legacy_string_and_object_shapes_normalize_to_the_same_rows() {
    let from_string = normalize_legacy_mapping(&serde_json::json!("plan_pro"), "INR").unwrap();
    let from_object =
        normalize_legacy_mapping(&serde_json::json!({ "INR": "plan_pro" }), "USD").unwrap();
    assert_eq!(from_string, from_object);
}

#[test]
fn whitespace_in_legacy_ids_is_trimmed() {
    let entries = normalize_legacy_mapping(&serde_json::json!("  plan_pro  "), "inr").unwrap();
    assert_eq!(entries, vec![("INR".to_string(), "plan_pro".to_string())]);
}
