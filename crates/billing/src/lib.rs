// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pawsly Billing Module
//!
//! Subscription lifecycle and billing simulation for the Pawsly clinic
//! platform.
//!
//! ## Features
//!
//! - **Subscription Management**: Subscribe, cancel, resume, and swap plans
//!   with proration
//! - **Plan Catalog**: Tiered plans with feature flags, limits, and trials
//! - **Billing Generator**: Backfill and per-cycle settlement of periodic
//!   charges with an idempotent ledger
//! - **Payment Gateway Simulator**: Deterministic charge outcomes over
//!   balance-carrying instruments, with per-method fees
//! - **Revenue Aggregation**: Collected revenue, MRR/ARR, churn, growth,
//!   plan distribution
//! - **Invariants**: Runnable consistency checks over stores and ledgers
//! - **Events**: Structured lifecycle event stream

pub mod error;
pub mod events;
pub mod gateway;
pub mod generator;
pub mod invariants;
pub mod ledger;
pub mod plans;
pub mod proration;
pub mod revenue;
pub mod store;
pub mod subscriptions;


// Error
pub use error::{BillingError, BillingResult, DeclineReason, StoreError};

// Events
pub use events::{BillingEvent, BillingEventType, ChannelEventSink, EventSink, TracingEventSink};

// Gateway
pub use gateway::{
    ChargeOutcome, FeeBreakdown, FeeRate, FeeSchedule, InMemoryPaymentLedger, PaymentGateway,
    PaymentInstrument, PaymentLedger, TransferOutcome,
};

// Generator
pub use generator::BillingGenerator;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{BillingLedger, BillingRecord, BillingRecordStatus, InMemoryBillingLedger};

// Plans
pub use plans::{InMemoryPlanCatalog, Plan, PlanCatalog, UNLIMITED};

// Proration
pub use proration::{days_between, prorate, ProrationPreview, PRORATION_MONTH_DAYS};

// Revenue
pub use revenue::{RevenueReport, RevenueService};

// Store
pub use store::{InMemorySubscriptionStore, SubscriptionStore};

// Subscriptions
pub use subscriptions::{ExpirationSweep, Subscription, SubscriptionService};

use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub generator: BillingGenerator,
    pub revenue: RevenueService,
    pub invariants: InvariantChecker,
    pub gateway: PaymentGateway,
    pub store: Arc<dyn SubscriptionStore>,
}

impl BillingService {
    /// Wire all services over the given stores and event sink.
    pub fn new(
        catalog: Arc<dyn PlanCatalog>,
        store: Arc<dyn SubscriptionStore>,
        billing_ledger: Arc<dyn BillingLedger>,
        payment_ledger: Arc<dyn PaymentLedger>,
        fees: FeeSchedule,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let gateway = PaymentGateway::with_fee_schedule(payment_ledger.clone(), fees);

        Self {
            subscriptions: SubscriptionService::new(
                catalog.clone(),
                store.clone(),
                billing_ledger.clone(),
                gateway.clone(),
                events.clone(),
            ),
            generator: BillingGenerator::new(
                catalog.clone(),
                store.clone(),
                billing_ledger.clone(),
                gateway.clone(),
                events,
            ),
            revenue: RevenueService::new(catalog, store.clone(), billing_ledger.clone()),
            invariants: InvariantChecker::new(store.clone(), billing_ledger, payment_ledger),
            gateway,
            store,
        }
    }

    /// Fully in-memory service over the stock plan catalog, with gateway fees
    /// taken from the environment. This is what the simulation worker runs.
    pub fn in_memory(events: Arc<dyn EventSink>) -> Self {
        Self::new(
            InMemoryPlanCatalog::stock(),
            InMemorySubscriptionStore::new(),
            InMemoryBillingLedger::new(),
            InMemoryPaymentLedger::new(),
            FeeSchedule::from_env(),
            events,
        )
    }
}
