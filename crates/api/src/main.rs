//! Billing API server: webhook ingestion, entitlement checks, and the
//! admin surface over the billing engine.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use resumehq_billing::BillingEngine;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,resumehq_api=debug,resumehq_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting billing API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations applied");

    let engine = BillingEngine::new(pool.clone(), &config.billing)?;
    let state = AppState::new(engine, pool);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
