//! Recurring billing generator
//!
//! Two entry points share one charge cycle:
//!
//! * [`BillingGenerator::generate_billing_history`] walks every interval
//!   boundary from the subscription's billing origin up to now (or its end
//!   date) and fills in any ledger entry that is missing. Safe to re-run;
//!   the ledger claim makes each `(subscription, date)` bill at most once.
//! * [`BillingGenerator::process_billing`] settles the boundary of the cycle
//!   `now` falls in and moves the subscription between `active` and
//!   `past_due` based on the outcome. This is what the scheduled billing job
//!   calls. Both paths key records by the boundary date, so extra triggers
//!   inside an already-settled period are no-ops.
//!
//! Both tolerate partial failure: one bad date or one unreachable instrument
//! is logged and skipped, never aborting the rest of the run.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pawsly_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult, StoreError};
use crate::events::{BillingEvent, BillingEventType, EventSink};
use crate::gateway::{ChargeOutcome, PaymentGateway};
use crate::ledger::{BillingLedger, BillingRecord, BillingRecordStatus};
use crate::plans::PlanCatalog;
use crate::store::SubscriptionStore;
use crate::subscriptions::Subscription;

/// What settling one boundary did
enum BoundaryOutcome {
    /// Key already taken, or no chargeable instrument
    Skipped,
    Paid { transaction_id: Uuid },
    Failed,
}

/// Generates and settles periodic billing records
pub struct BillingGenerator {
    catalog: Arc<dyn PlanCatalog>,
    subscriptions: Arc<dyn SubscriptionStore>,
    billing_ledger: Arc<dyn BillingLedger>,
    gateway: PaymentGateway,
    events: Arc<dyn EventSink>,
}

impl BillingGenerator {
    pub fn new(
        catalog: Arc<dyn PlanCatalog>,
        subscriptions: Arc<dyn SubscriptionStore>,
        billing_ledger: Arc<dyn BillingLedger>,
        gateway: PaymentGateway,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            billing_ledger,
            gateway,
            events,
        }
    }

    /// Backfill ledger entries for every elapsed interval boundary.
    ///
    /// Returns the number of records written this run. Boundaries that
    /// already carry a record (including the day-0 record written at
    /// subscribe time) are skipped, so the call is idempotent.
    pub async fn generate_billing_history(&self, subscription_id: Uuid) -> BillingResult<usize> {
        let subscription = self.load(subscription_id).await?;
        let plan = self.catalog.get_or_free(&subscription.plan_slug).await?;
        let cycle_price = plan.price(subscription.billing_interval);
        if cycle_price.is_zero() {
            return Ok(0);
        }

        let now = Utc::now();
        // Billable while the boundary is strictly before both now and any
        // scheduled end.
        let limit = match subscription.ends_at {
            Some(ends_at) if ends_at < now => ends_at,
            _ => now,
        };

        let step = Months::new(subscription.billing_interval.months());
        let mut boundary = subscription.billing_origin();
        let mut written = 0usize;
        while boundary < limit {
            match self
                .settle_boundary(&subscription, cycle_price, boundary, boundary + step)
                .await
            {
                Ok(BoundaryOutcome::Skipped) => {}
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(
                        %subscription_id,
                        billing_date = %boundary.date_naive(),
                        error = %e,
                        "skipping boundary after transient failure"
                    );
                }
            }
            boundary = boundary + step;
        }

        info!(%subscription_id, written, "billing history generated");
        Ok(written)
    }

    /// Charge one boundary. `Skipped` means the date was already settled or
    /// no chargeable instrument exists; transient failures release the claim
    /// so a retry can pick the date up again.
    async fn settle_boundary(
        &self,
        subscription: &Subscription,
        amount: Decimal,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<BoundaryOutcome, StoreError> {
        let billing_date = period_start.date_naive();
        if !self
            .billing_ledger
            .claim(subscription.id, billing_date)
            .await?
        {
            debug!(
                subscription_id = %subscription.id,
                %billing_date,
                "billing date already settled"
            );
            return Ok(BoundaryOutcome::Skipped);
        }

        let instrument_id = match self.select_instrument(subscription, amount).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(
                    subscription_id = %subscription.id,
                    %billing_date,
                    "no chargeable instrument, leaving date open"
                );
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                return Ok(BoundaryOutcome::Skipped);
            }
            Err(e) => {
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                return Err(e);
            }
        };

        let outcome = match self.gateway.charge(instrument_id, amount).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                return Err(e);
            }
        };

        let (status, transaction_id, settled) = match outcome {
            ChargeOutcome::Succeeded { transaction_id } => (
                BillingRecordStatus::Paid,
                transaction_id,
                BoundaryOutcome::Paid { transaction_id },
            ),
            // A decline is a settled attempt; record it so the date is not
            // retried forever.
            ChargeOutcome::Declined { reason } => {
                self.events.emit(BillingEvent::new(
                    BillingEventType::BillingFailed,
                    subscription.id,
                    subscription.owner_id,
                    serde_json::json!({
                        "billing_date": billing_date,
                        "amount": amount,
                        "reason": reason,
                    }),
                ));
                (
                    BillingRecordStatus::Failed,
                    Uuid::new_v4(),
                    BoundaryOutcome::Failed,
                )
            }
        };

        self.billing_ledger
            .commit(BillingRecord {
                subscription_id: subscription.id,
                amount,
                billing_date,
                period_start,
                period_end,
                status,
                payment_instrument_id: Some(instrument_id),
                transaction_id,
            })
            .await?;
        Ok(settled)
    }

    /// Settle the cycle `now` falls in and keep the subscription's status in
    /// step with the outcome.
    ///
    /// The record is keyed by the period's boundary date, the same key the
    /// backfill and the subscribe-time charge use, so a period that is
    /// already settled is never charged again no matter how often the
    /// scheduled job fires.
    ///
    /// Returns whether a successful charge happened. A decline records a
    /// failed entry and marks the subscription `past_due`; the next cycle's
    /// successful charge clears it back to `active`.
    pub async fn process_billing(&self, subscription_id: Uuid) -> BillingResult<bool> {
        let mut subscription = self.load(subscription_id).await?;
        let now = Utc::now();

        if subscription.status == SubscriptionStatus::Canceled || subscription.has_ended(now) {
            return Ok(false);
        }
        if subscription.is_on_trial(now) {
            return Ok(false);
        }

        let plan = self.catalog.get_or_free(&subscription.plan_slug).await?;
        let cycle_price = plan.price(subscription.billing_interval);
        if cycle_price.is_zero() {
            return Ok(false);
        }

        // Nothing is due before the billing timeline starts
        let Some(period_start) = subscription.current_period_start(now) else {
            return Ok(false);
        };
        let period_end = period_start + Months::new(subscription.billing_interval.months());

        match self
            .settle_boundary(&subscription, cycle_price, period_start, period_end)
            .await?
        {
            BoundaryOutcome::Skipped => {
                debug!(%subscription_id, "current cycle already settled or not chargeable");
                Ok(false)
            }
            BoundaryOutcome::Paid { transaction_id } => {
                if subscription.status == SubscriptionStatus::PastDue {
                    subscription.status = SubscriptionStatus::Active;
                    self.subscriptions.update(subscription.clone()).await?;
                    info!(%subscription_id, "past_due subscription recovered");
                }
                self.events.emit(BillingEvent::new(
                    BillingEventType::BillingSucceeded,
                    subscription.id,
                    subscription.owner_id,
                    serde_json::json!({
                        "billing_date": period_start.date_naive(),
                        "amount": cycle_price,
                        "transaction_id": transaction_id,
                    }),
                ));
                Ok(true)
            }
            BoundaryOutcome::Failed => {
                if subscription.status != SubscriptionStatus::PastDue {
                    subscription.status = SubscriptionStatus::PastDue;
                    self.subscriptions.update(subscription.clone()).await?;
                }
                warn!(%subscription_id, "cycle charge declined, subscription past_due");
                Ok(false)
            }
        }
    }

    /// The subscription's own instrument when bound, otherwise the lowest-id
    /// registered instrument that can cover the amount. Deterministic so
    /// repeated runs pick the same card.
    async fn select_instrument(
        &self,
        subscription: &Subscription,
        amount: Decimal,
    ) -> Result<Option<Uuid>, StoreError> {
        if let Some(id) = subscription.payment_instrument_id {
            return Ok(Some(id));
        }
        let mut candidates: Vec<Uuid> = self
            .gateway
            .ledger()
            .list_instruments()
            .await?
            .into_iter()
            .filter(|i| i.is_registered && !i.is_blocked && i.balance >= amount)
            .map(|i| i.id)
            .collect();
        candidates.sort_unstable();
        Ok(candidates.first().copied())
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }
}
