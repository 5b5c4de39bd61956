//! Billing background worker
//!
//! Scheduled jobs:
//! - Subscription lifecycle sweep: grace entry, expiry, freemium rollover,
//!   scheduled downgrades (hourly)
//! - Failed webhook retry (every 5 minutes)
//! - Lapsed usage counter resets (hourly)
//! - Processed webhook cleanup (daily at 02:30 UTC)
//! - Billing invariant run (daily at 03:00 UTC)

use std::time::Duration;

use resumehq_billing::{BillingConfig, BillingEngine};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

const WEBHOOK_RETRY_BATCH: i64 = 50;
const WEBHOOK_RETENTION_DAYS: i32 = 90;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting billing worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = create_db_pool().await?;
    let config = BillingConfig::from_env()?;
    let engine = BillingEngine::new(pool, &config)?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Lifecycle sweep, hourly at :05
    let subscriptions = engine.subscriptions.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let service = subscriptions.clone();
            Box::pin(async move {
                info!("Running subscription lifecycle sweep");
                match service.run_lifecycle_sweep().await {
                    Ok(counts) => info!(
                        renewed_freemium = counts.renewed_freemium,
                        entered_grace = counts.entered_grace,
                        expired = counts.expired,
                        downgrades_applied = counts.downgrades_applied,
                        "Lifecycle sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Lifecycle sweep failed"),
                }
            })
        })?)
        .await?;

    // Job 2: Retry failed webhooks, every 5 minutes
    let webhooks = engine.webhooks.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = webhooks.clone();
            Box::pin(async move {
                match service.retry_failed(WEBHOOK_RETRY_BATCH).await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered = recovered, "Webhook retries recovered"),
                    Err(e) => error!(error = %e, "Webhook retry run failed"),
                }
            })
        })?)
        .await?;

    // Job 3: Reset lapsed usage counters, hourly at :15
    let entitlements = engine.entitlements.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let service = entitlements.clone();
            Box::pin(async move {
                match service.reset_lapsed_counters().await {
                    Ok(0) => {}
                    Ok(reset) => info!(reset = reset, "Usage counters reset"),
                    Err(e) => error!(error = %e, "Usage counter reset failed"),
                }
            })
        })?)
        .await?;

    // Job 4: Clean up old processed webhooks, daily at 02:30 UTC
    let webhooks = engine.webhooks.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let service = webhooks.clone();
            Box::pin(async move {
                match service.cleanup_processed(WEBHOOK_RETENTION_DAYS).await {
                    Ok(deleted) => info!(deleted = deleted, "Webhook cleanup finished"),
                    Err(e) => error!(error = %e, "Webhook cleanup failed"),
                }
            })
        })?)
        .await?;

    // Job 5: Billing invariant run, daily at 03:00 UTC
    let invariants = engine.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = invariants.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all().await {
                    Ok(violations) if violations.is_empty() => {
                        info!("All billing invariants hold")
                    }
                    Ok(violations) => {
                        error!(count = violations.len(), "Billing invariants violated")
                    }
                    Err(e) => error!(error = %e, "Invariant run failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Scheduler started with 5 jobs");

    // Keep the process alive; the scheduler runs on the tokio runtime.
    loop {
        tokio::time::sleep(Duration::from_secs(300)).await;
        info!("Worker heartbeat");
    }
}
