//! Shared application state

use resumehq_billing::BillingEngine;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub engine: BillingEngine,
    pub pool: PgPool,
}

impl AppState {
    pub fn new(engine: BillingEngine, pool: PgPool) -> Self {
        Self { engine, pool }
    }
}
