//! Subscription and entitlement engine
//!
//! Everything that decides who may do what, and who paid for it: the plan
//! catalog, the entitlement ledger, the subscription lifecycle, payment
//! gateway adapters, webhook reconciliation, the payment ledger, and tax
//! and invoicing. HTTP surfaces and background jobs live in their own
//! crates and talk to this one through [`BillingEngine`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod payments;
pub mod subscriptions;
pub mod tax;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use catalog::{BillingCycle, LimitType, Plan, PlanCatalog, PlanPricing, ResetFrequency};
pub use config::BillingConfig;
pub use entitlement::{Consumption, EntitlementLedger, FeatureUsageView};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use gateway::{GatewayConfig, GatewayKind, GatewayRegistry, PlanMappingStore};
pub use invariants::{InvariantChecker, InvariantViolation, ViolationSeverity};
pub use payments::{PaymentLedger, Transaction, TransactionStatus};
pub use subscriptions::{
    PlanChangeType, Subscription, SubscriptionService, SubscriptionStatus, SweepCounts,
};
pub use tax::{compute_breakdown, round_money, Invoice, TaxBreakdown, TaxService};
pub use webhooks::{IngestOutcome, WebhookReconciler};

use sqlx::PgPool;

/// All billing services wired together over one connection pool.
#[derive(Clone)]
pub struct BillingEngine {
    pub catalog: PlanCatalog,
    pub entitlements: EntitlementLedger,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentLedger,
    pub webhooks: WebhookReconciler,
    pub tax: TaxService,
    pub gateways: GatewayRegistry,
    pub plan_mappings: PlanMappingStore,
    pub invariants: InvariantChecker,
    pub events: BillingEventLogger,
}

impl BillingEngine {
    pub fn new(pool: PgPool, config: &BillingConfig) -> BillingResult<Self> {
        let catalog = PlanCatalog::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        let entitlements = EntitlementLedger::new(pool.clone(), catalog.clone());
        let subscriptions = SubscriptionService::new(
            pool.clone(),
            catalog.clone(),
            entitlements.clone(),
            events.clone(),
        )
        .with_grace_period(config.grace_period);
        let payments = PaymentLedger::new(pool.clone(), events.clone());
        let tax = TaxService::new(pool.clone());
        let plan_mappings = PlanMappingStore::new(pool.clone());
        let gateways = GatewayRegistry::from_configs(config.gateways.clone())?;
        let webhooks = WebhookReconciler::new(
            pool.clone(),
            payments.clone(),
            subscriptions.clone(),
            catalog.clone(),
            plan_mappings.clone(),
            tax.clone(),
        );
        let invariants = InvariantChecker::new(pool);

        Ok(Self {
            catalog,
            entitlements,
            subscriptions,
            payments,
            webhooks,
            tax,
            gateways,
            plan_mappings,
            invariants,
            events,
        })
    }
}
