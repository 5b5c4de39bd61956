//! End-to-end flows over a real database: webhook replay safety, limit
//! enforcement under the seeded catalog, and the lifecycle sweep.

use resumehq_billing::{
    ActorType, BillingError, BillingEventLogger, EntitlementLedger, GatewayKind, IngestOutcome,
    PaymentLedger, PlanCatalog, PlanMappingStore, SubscriptionService, SubscriptionStatus,
    TaxService, WebhookReconciler,
};

struct Services {
    catalog: PlanCatalog,
    entitlements: EntitlementLedger,
    subscriptions: SubscriptionService,
    webhooks: WebhookReconciler,
}
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

fn services(pool: &PgPool) -> Services {
    let catalog = PlanCatalog::new(pool.clone());
    let events = BillingEventLogger::new(pool.clone());
    let entitlements = EntitlementLedger::new(pool.clone(), catalog.clone());
    let subscriptions = SubscriptionService::new(
        pool.clone(),
        catalog.clone(),
        entitlements.clone(),
        events.clone(),
    );
    let payments = PaymentLedger::new(pool.clone(), events);
    let webhooks = WebhookReconciler::new(
        pool.clone(),
        payments,
        subscriptions.clone(),
        catalog.clone(),
        PlanMappingStore::new(pool.clone()),
        TaxService::new(pool.clone()),
    );
    Services {
        catalog,
        entitlements,
        subscriptions,
        webhooks,
    }
}

fn razorpay_capture(payment_id: &str, user_id: Uuid, amount_paise: i64) -> serde_json::Value {
    serde_json::json!({
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "amount": amount_paise,
                    "currency": "INR",
                    "notes": { "user_id": user_id.to_string() }
                }
            }
        }
    })
}

async fn lapse_subscription(pool: &PgPool, subscription_id: Uuid) {
    sqlx::query("UPDATE subscriptions SET ends_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(subscription_id)
        .execute(pool)
        .await
        .unwrap();
}

// ============================================================
// Webhook replay safety
// ============================================================

#[sqlx::test(migrations = "../../migrations")]
async fn replayed_capture_under_a_fresh_envelope_does_not_extend_the_period(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    svc.subscriptions
        .activate_purchase(user_id, plan.id, Some("razorpay"), None, ActorType::Admin)
        .await
        .unwrap();

    let payload = razorpay_capture("pay_SAME", user_id, 49900);

    let first = svc
        .webhooks
        .ingest(GatewayKind::Razorpay, "evt_1", "payment.captured", &payload)
        .await
        .unwrap();
    assert_eq!(first, IngestOutcome::Processed);

    let after_first = svc
        .subscriptions
        .current_subscription(user_id)
        .await
        .unwrap()
        .unwrap();

    // The gateway re-delivers the same logical payment under a new
    // envelope id. It must claim and process, but as a no-op.
    let second = svc
        .webhooks
        .ingest(GatewayKind::Razorpay, "evt_2", "payment.captured", &payload)
        .await
        .unwrap();
    assert_eq!(second, IngestOutcome::Processed);

    let after_second = svc
        .subscriptions
        .current_subscription(user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        after_second.ends_at, after_first.ends_at,
        "replayed logical payment must not extend the paid period again"
    );

    let (txn_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(txn_count, 1);

    let (invoice_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM invoices WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(invoice_count, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn same_envelope_replay_reports_already_processed(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    svc.subscriptions
        .activate_purchase(user_id, plan.id, Some("razorpay"), None, ActorType::Admin)
        .await
        .unwrap();

    let payload = razorpay_capture("pay_ONE", user_id, 49900);
    let first = svc
        .webhooks
        .ingest(GatewayKind::Razorpay, "evt_dup", "payment.captured", &payload)
        .await
        .unwrap();
    assert_eq!(first, IngestOutcome::Processed);

    let replay = svc
        .webhooks
        .ingest(GatewayKind::Razorpay, "evt_dup", "payment.captured", &payload)
        .await
        .unwrap();
    assert_eq!(replay, IngestOutcome::AlreadyProcessed);
}

#[sqlx::test(migrations = "../../migrations")]
async fn mid_term_payment_failure_does_not_open_a_grace_window(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    let sub = svc
        .subscriptions
        .activate_purchase(user_id, plan.id, Some("razorpay"), None, ActorType::Admin)
        .await
        .unwrap();

    // A failed one-off payment in the middle of an already-paid period is
    // ledger-only; the subscription stays active until its boundary.
    let payload = serde_json::json!({
        "payload": {
            "payment": {
                "entity": {
                    "id": "pay_MIDTERM",
                    "amount": 49900,
                    "currency": "INR",
                    "notes": { "user_id": user_id.to_string() }
                }
            }
        }
    });
    let outcome = svc
        .webhooks
        .ingest(GatewayKind::Razorpay, "evt_fail", "payment.failed", &payload)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Processed);

    let current = svc.subscriptions.get_subscription(sub.id).await.unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert!(current.grace_ends_at.is_none());

    // The failure is still on the books.
    let (failed_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM transactions WHERE user_id = $1 AND status = 'failed'",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(failed_count, 1);
}

// ============================================================
// Entitlement limits
// ============================================================

#[sqlx::test(migrations = "../../migrations")]
async fn usage_never_passes_the_limit(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let free = svc.catalog.get_plan_by_code("free").await.unwrap();

    svc.subscriptions
        .activate_purchase(user_id, free.id, None, None, ActorType::Admin)
        .await
        .unwrap();

    // Free grants resume_create a monthly limit of 3.
    for remaining in [2i64, 1, 0] {
        let outcome = svc
            .entitlements
            .check_and_consume(user_id, "resume_create", 1)
            .await
            .unwrap();
        assert_eq!(outcome.remaining, Some(remaining));
    }

    let denied = svc
        .entitlements
        .check_and_consume(user_id, "resume_create", 1)
        .await;
    match denied {
        Err(BillingError::LimitExceeded { used, limit, .. }) => {
            assert_eq!(used, 3);
            assert_eq!(limit, 3);
        }
        other => panic!("expected LimitExceeded, got {:?}", other),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn bulk_consume_over_the_limit_reports_actual_usage(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let free = svc.catalog.get_plan_by_code("free").await.unwrap();

    svc.subscriptions
        .activate_purchase(user_id, free.id, None, None, ActorType::Admin)
        .await
        .unwrap();

    svc.entitlements
        .check_and_consume(user_id, "resume_create", 2)
        .await
        .unwrap();

    // Asking for more than the whole limit in one go is rejected, and the
    // error carries what is actually used, not a placeholder.
    let denied = svc
        .entitlements
        .check_and_consume(user_id, "resume_create", 5)
        .await;
    match denied {
        Err(BillingError::LimitExceeded { used, limit, .. }) => {
            assert_eq!(used, 2);
            assert_eq!(limit, 3);
        }
        other => panic!("expected LimitExceeded, got {:?}", other),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn lapsed_reset_window_clears_before_the_check(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let free = svc.catalog.get_plan_by_code("free").await.unwrap();

    svc.subscriptions
        .activate_purchase(user_id, free.id, None, None, ActorType::Admin)
        .await
        .unwrap();

    for _ in 0..3 {
        svc.entitlements
            .check_and_consume(user_id, "resume_create", 1)
            .await
            .unwrap();
    }
    assert!(svc
        .entitlements
        .check_and_consume(user_id, "resume_create", 1)
        .await
        .is_err());

    // Move the reset window into the past; the next consume starts a
    // fresh period instead of staying stuck at the old limit.
    sqlx::query(
        "UPDATE feature_usage SET reset_at = NOW() - INTERVAL '1 minute' WHERE user_id = $1",
    )
    .bind(user_id)
    .execute(&pool)
    .await
    .unwrap();

    let outcome = svc
        .entitlements
        .check_and_consume(user_id, "resume_create", 1)
        .await
        .unwrap();
    assert_eq!(outcome.remaining, Some(2));
}

// ============================================================
// Lifecycle sweep
// ============================================================

#[sqlx::test(migrations = "../../migrations")]
async fn sweep_graces_auto_renew_and_expires_opted_out(pool: PgPool) {
    let svc = services(&pool);
    let renewing = Uuid::new_v4();
    let opted_out = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    let renewing_sub = svc
        .subscriptions
        .activate_purchase(renewing, plan.id, None, None, ActorType::Admin)
        .await
        .unwrap();
    let opted_out_sub = svc
        .subscriptions
        .activate_purchase(opted_out, plan.id, None, None, ActorType::Admin)
        .await
        .unwrap();
    svc.subscriptions
        .set_auto_renew(opted_out, false, ActorType::User)
        .await
        .unwrap();

    lapse_subscription(&pool, renewing_sub.id).await;
    lapse_subscription(&pool, opted_out_sub.id).await;

    let counts = svc.subscriptions.run_lifecycle_sweep().await.unwrap();
    assert_eq!(counts.entered_grace, 1);
    assert_eq!(counts.expired, 1);

    let renewing_now = svc
        .subscriptions
        .get_subscription(renewing_sub.id)
        .await
        .unwrap();
    assert_eq!(renewing_now.status, SubscriptionStatus::GracePeriod);

    let opted_out_now = svc
        .subscriptions
        .get_subscription(opted_out_sub.id)
        .await
        .unwrap();
    assert_eq!(opted_out_now.status, SubscriptionStatus::Expired);

    // The expired user lands on the freemium plan.
    let fallback = svc
        .subscriptions
        .current_subscription(opted_out)
        .await
        .unwrap()
        .unwrap();
    let fallback_plan = svc.catalog.get_plan(fallback.plan_id).await.unwrap();
    assert!(fallback_plan.is_freemium);
}

#[sqlx::test(migrations = "../../migrations")]
async fn retired_plan_does_not_stall_the_sweep(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    let sub = svc
        .subscriptions
        .activate_purchase(user_id, plan.id, None, None, ActorType::Admin)
        .await
        .unwrap();

    // Admin retires the plan after the purchase. Existing subscribers
    // keep their lifecycle.
    sqlx::query("UPDATE plans SET is_active = false WHERE id = $1")
        .bind(plan.id)
        .execute(&pool)
        .await
        .unwrap();

    lapse_subscription(&pool, sub.id).await;

    let counts = svc.subscriptions.run_lifecycle_sweep().await.unwrap();
    assert_eq!(counts.entered_grace, 1);

    let graced = svc.subscriptions.get_subscription(sub.id).await.unwrap();
    assert_eq!(graced.status, SubscriptionStatus::GracePeriod);
    assert!(graced.grace_ends_at.is_some());
}

#[sqlx::test(migrations = "../../migrations")]
async fn grace_window_lapse_expires_and_falls_back_to_freemium(pool: PgPool) {
    let svc = services(&pool);
    let user_id = Uuid::new_v4();
    let plan = svc.catalog.get_plan_by_code("pro_monthly").await.unwrap();

    let sub = svc
        .subscriptions
        .activate_purchase(user_id, plan.id, None, None, ActorType::Admin)
        .await
        .unwrap();
    lapse_subscription(&pool, sub.id).await;

    let first_pass = svc.subscriptions.run_lifecycle_sweep().await.unwrap();
    assert_eq!(first_pass.entered_grace, 1);

    sqlx::query(
        "UPDATE subscriptions SET grace_ends_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(sub.id)
    .execute(&pool)
    .await
    .unwrap();

    let second_pass = svc.subscriptions.run_lifecycle_sweep().await.unwrap();
    assert_eq!(second_pass.expired, 1);

    let expired = svc.subscriptions.get_subscription(sub.id).await.unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    assert!(!expired.grants_access(OffsetDateTime::now_utc()));
}
