//! Subscription lifecycle management
//!
//! `SubscriptionService` owns every subscription state transition:
//! subscribe, cancel (immediate or at period end), resume, and mid-cycle plan
//! swaps with proration. It is the only writer of subscription state; the
//! billing generator only flips `active`/`past_due` around periodic charges.
//!
//! All mutations are all-or-nothing: a declined initial charge rolls the new
//! subscription back out of the store, and a declined swap charge leaves the
//! old plan in place.

use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use pawsly_shared::{BillingInterval, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventType, EventSink};
use crate::gateway::{ChargeOutcome, PaymentGateway};
use crate::ledger::{BillingLedger, BillingRecord, BillingRecordStatus};
use crate::plans::PlanCatalog;
use crate::proration::{days_between, prorate, ProrationPreview};
use crate::store::SubscriptionStore;

/// A subscription as the lifecycle manager sees it
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub plan_slug: String,
    pub status: SubscriptionStatus,
    pub billing_interval: BillingInterval,
    /// Preferred instrument for recurring charges; the generator may fall
    /// back to any registered instrument with sufficient balance
    pub payment_instrument_id: Option<Uuid>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Non-null means the subscription ends (or ended) at this instant
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_on_trial(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trialing
            && self.trial_ends_at.is_some_and(|t| t > now)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|e| e <= now)
    }

    /// Start of the recurring billing timeline: trial end when a trial was
    /// granted, creation time otherwise.
    pub fn billing_origin(&self) -> DateTime<Utc> {
        self.trial_ends_at.unwrap_or(self.created_at)
    }

    /// Start of the period `now` falls in: the latest interval boundary at
    /// or before `now`, or `None` while `now` precedes the billing origin.
    pub fn current_period_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let origin = self.billing_origin();
        if now < origin {
            return None;
        }
        let step = Months::new(self.billing_interval.months());
        let mut boundary = origin;
        while boundary + step <= now {
            boundary = boundary + step;
        }
        Some(boundary)
    }

    /// End of the period `now` falls in: the trial end while on trial,
    /// otherwise the next interval boundary on the billing timeline.
    pub fn current_period_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(trial_end) = self.trial_ends_at {
            if trial_end > now {
                return trial_end;
            }
        }
        let step = Months::new(self.billing_interval.months());
        let mut boundary = self.billing_origin();
        while boundary <= now {
            boundary = boundary + step;
        }
        boundary
    }
}

/// Counters from one expiry sweep, for scheduler logs
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExpirationSweep {
    /// Subscriptions whose scheduled `ends_at` passed
    pub period_end_cancellations: usize,
    /// Trials that expired on a paid plan without a successful charge
    pub trial_cancellations: usize,
    /// Trials promoted to active: free plan, a prior paid record, or a
    /// successful conversion charge
    pub trial_activations: usize,
}

/// Lifecycle manager for subscriptions
pub struct SubscriptionService {
    catalog: Arc<dyn PlanCatalog>,
    subscriptions: Arc<dyn SubscriptionStore>,
    billing_ledger: Arc<dyn BillingLedger>,
    gateway: PaymentGateway,
    events: Arc<dyn EventSink>,
}

impl SubscriptionService {
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

    /// Subscribe `owner_id` to a plan.
    ///
    /// Trial plans start `trialing` with no charge; free plans start
    /// `active`; paid no-trial plans require an instrument and are charged
    /// the first period up front. Creation and the first charge are atomic;
    /// a decline leaves no subscription and no ledger entry behind.
    pub async fn subscribe(
        &self,
        owner_id: Uuid,
        plan_slug: &str,
        payment_instrument_id: Option<Uuid>,
        billing_interval: BillingInterval,
    ) -> BillingResult<Subscription> {
        let plan = self
            .catalog
            .get_plan(plan_slug)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_slug.to_string()))?;

        if let Some(existing) = self
            .subscriptions
            .find_non_canceled_by_owner(owner_id)
            .await?
        {
            warn!(
                %owner_id,
                existing_subscription = %existing.id,
                "subscribe rejected: owner already subscribed"
            );
            return Err(BillingError::AlreadySubscribed(owner_id));
        }

        let now = Utc::now();
        let mut subscription = Subscription {
            id: Uuid::new_v4(),
            owner_id,
            plan_slug: plan.slug.clone(),
            status: SubscriptionStatus::Active,
            billing_interval,
            payment_instrument_id,
            trial_ends_at: None,
            ends_at: None,
            created_at: now,
        };

        let cycle_price = plan.price(billing_interval);
        if plan.trial_days > 0 {
            subscription.status = SubscriptionStatus::Trialing;
            subscription.trial_ends_at = Some(now + Duration::days(i64::from(plan.trial_days)));
            self.subscriptions.insert(subscription.clone()).await?;
        } else if cycle_price.is_zero() {
            self.subscriptions.insert(subscription.clone()).await?;
        } else {
            let instrument_id =
                payment_instrument_id.ok_or(BillingError::InstrumentRequired)?;
            subscription = self
                .subscribe_with_initial_charge(subscription, instrument_id, cycle_price, now)
                .await?;
        }

        info!(
            subscription_id = %subscription.id,
            %owner_id,
            plan = %plan.slug,
            status = %subscription.status,
            "subscription created"
        );
        self.events.emit(BillingEvent::new(
            BillingEventType::Subscribed,
            subscription.id,
            owner_id,
            serde_json::json!({
                "plan": plan.slug,
                "status": subscription.status,
                "billing_interval": billing_interval,
            }),
        ));
        Ok(subscription)
    }

    /// Insert + charge + day-0 ledger record, undone together on any failure.
    async fn subscribe_with_initial_charge(
        &self,
        subscription: Subscription,
        instrument_id: Uuid,
        cycle_price: rust_decimal::Decimal,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.subscriptions.insert(subscription.clone()).await?;

        let billing_date = now.date_naive();
        if !self
            .billing_ledger
            .claim(subscription.id, billing_date)
            .await?
        {
            // Fresh id, so an existing claim means a duplicated store seed
            self.subscriptions.delete(subscription.id).await?;
            return Err(BillingError::Store(crate::error::StoreError::Unavailable(
                format!("billing date {billing_date} already claimed for new subscription"),
            )));
        }

        let outcome = match self.gateway.charge(instrument_id, cycle_price).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                self.subscriptions.delete(subscription.id).await?;
                return Err(e.into());
            }
        };

        match outcome {
            ChargeOutcome::Succeeded { transaction_id } => {
                let record = BillingRecord {
                    subscription_id: subscription.id,
                    amount: cycle_price,
                    billing_date,
                    period_start: now,
                    period_end: subscription.current_period_end(now),
                    status: BillingRecordStatus::Paid,
                    payment_instrument_id: Some(instrument_id),
                    transaction_id,
                };
                self.billing_ledger.commit(record).await?;
                Ok(subscription)
            }
            ChargeOutcome::Declined { reason } => {
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                self.subscriptions.delete(subscription.id).await?;
                info!(
                    subscription_id = %subscription.id,
                    %reason,
                    "subscribe rolled back: initial charge declined"
                );
                Err(BillingError::PaymentDeclined(reason))
            }
        }
    }

    /// Cancel a subscription, either now or at the end of the current paid
    /// period. Canceling an already-canceled subscription is a no-op.
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        immediately: bool,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.load(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Ok(subscription);
        }

        let now = Utc::now();
        if immediately {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.ends_at = Some(now);
        } else {
            // Still billable until the period runs out; the expiry sweep
            // flips the status once ends_at passes.
            subscription.ends_at = Some(subscription.current_period_end(now));
        }
        self.subscriptions.update(subscription.clone()).await?;

        info!(
            %subscription_id,
            immediately,
            ends_at = ?subscription.ends_at,
            "subscription canceled"
        );
        self.events.emit(BillingEvent::new(
            BillingEventType::Canceled,
            subscription.id,
            subscription.owner_id,
            serde_json::json!({
                "immediately": immediately,
                "ends_at": subscription.ends_at,
            }),
        ));
        Ok(subscription)
    }

    /// Undo a pending period-end cancellation. Only possible while `ends_at`
    /// is still in the future.
    pub async fn resume(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let mut subscription = self.load(subscription_id).await?;

        let now = Utc::now();
        match subscription.ends_at {
            Some(ends_at) if ends_at > now => {}
            _ => return Err(BillingError::CannotResume),
        }

        subscription.ends_at = None;
        // Back on trial if the trial window is still open, otherwise active;
        // keeps the trialing <=> future trial_ends_at invariant intact.
        subscription.status = if subscription.trial_ends_at.is_some_and(|t| t > now) {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        self.subscriptions.update(subscription.clone()).await?;

        info!(%subscription_id, status = %subscription.status, "subscription resumed");
        self.events.emit(BillingEvent::new(
            BillingEventType::Resumed,
            subscription.id,
            subscription.owner_id,
            serde_json::json!({ "status": subscription.status }),
        ));
        Ok(subscription)
    }

    /// Preview what a swap would charge without committing anything.
    pub async fn preview_swap(
        &self,
        subscription_id: Uuid,
        new_plan_slug: &str,
    ) -> BillingResult<ProrationPreview> {
        let subscription = self.load(subscription_id).await?;
        let new_plan = self
            .catalog
            .get_plan(new_plan_slug)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(new_plan_slug.to_string()))?;
        let old_plan = self.catalog.get_or_free(&subscription.plan_slug).await?;

        let now = Utc::now();
        let period_end = subscription.current_period_end(now);
        let amount = prorate(
            old_plan.price(subscription.billing_interval),
            new_plan.price(subscription.billing_interval),
            now,
            period_end,
        );
        Ok(ProrationPreview::new(
            &old_plan.slug,
            &new_plan.slug,
            amount,
            days_between(now, period_end),
        ))
    }

    /// Swap to a new plan mid-cycle.
    ///
    /// Upgrades charge the prorated difference before the plan changes; a
    /// decline rejects the whole swap. Downgrades and lateral moves apply
    /// with no charge and no credit.
    pub async fn swap(
        &self,
        subscription_id: Uuid,
        new_plan_slug: &str,
        payment_instrument_id: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.load(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(BillingError::SubscriptionEnded);
        }

        let new_plan = self
            .catalog
            .get_plan(new_plan_slug)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(new_plan_slug.to_string()))?;
        // Dangling plan slugs on old subscriptions price as free
        let old_plan = self.catalog.get_or_free(&subscription.plan_slug).await?;

        let now = Utc::now();
        let amount = prorate(
            old_plan.price(subscription.billing_interval),
            new_plan.price(subscription.billing_interval),
            now,
            subscription.current_period_end(now),
        );

        let charge_instrument = payment_instrument_id.or(subscription.payment_instrument_id);
        if amount > rust_decimal::Decimal::ZERO {
            if let Some(instrument_id) = charge_instrument {
                match self.gateway.charge(instrument_id, amount).await? {
                    ChargeOutcome::Succeeded { transaction_id } => {
                        info!(
                            %subscription_id,
                            %amount,
                            %transaction_id,
                            "proration charged for plan swap"
                        );
                    }
                    ChargeOutcome::Declined { reason } => {
                        info!(%subscription_id, %reason, "swap rejected: proration charge declined");
                        return Err(BillingError::PaymentDeclined(reason));
                    }
                }
            }
        }

        let old_slug = std::mem::replace(&mut subscription.plan_slug, new_plan.slug.clone());
        if let Some(instrument_id) = payment_instrument_id {
            subscription.payment_instrument_id = Some(instrument_id);
        }
        self.subscriptions.update(subscription.clone()).await?;

        info!(
            %subscription_id,
            from = %old_slug,
            to = %new_plan.slug,
            prorated_amount = %amount,
            "plan swapped"
        );
        self.events.emit(BillingEvent::new(
            BillingEventType::Swapped,
            subscription.id,
            subscription.owner_id,
            serde_json::json!({
                "from_plan": old_slug,
                "to_plan": new_plan.slug,
                "prorated_amount": amount,
            }),
        ));
        Ok(subscription)
    }

    /// Apply the timed transitions of the state machine: scheduled period
    /// ends that have passed, and trials that ran out.
    ///
    /// An expired trial on a paid plan converts by charging the first
    /// post-trial period on the bound instrument; without an instrument, or
    /// when that charge declines, it cancels. Free-priced plans and trials
    /// the billing tick already settled activate without a charge.
    pub async fn finalize_expirations(&self, now: DateTime<Utc>) -> BillingResult<ExpirationSweep> {
        let mut sweep = ExpirationSweep::default();

        for mut subscription in self.subscriptions.list_all().await? {
            if subscription.status == SubscriptionStatus::Canceled {
                continue;
            }

            if subscription.has_ended(now) {
                subscription.status = SubscriptionStatus::Canceled;
                self.subscriptions.update(subscription.clone()).await?;
                sweep.period_end_cancellations += 1;
                self.events.emit(BillingEvent::new(
                    BillingEventType::Canceled,
                    subscription.id,
                    subscription.owner_id,
                    serde_json::json!({ "reason": "period_end" }),
                ));
                continue;
            }

            let trial_expired = subscription.status == SubscriptionStatus::Trialing
                && subscription.trial_ends_at.is_some_and(|t| t <= now);
            if !trial_expired {
                continue;
            }

            let plan = self.catalog.get_or_free(&subscription.plan_slug).await?;
            let cycle_price = plan.price(subscription.billing_interval);
            let paid_once = self
                .billing_ledger
                .records_for(subscription.id)
                .await?
                .iter()
                .any(|r| r.status == BillingRecordStatus::Paid);

            let converted = cycle_price.is_zero()
                || paid_once
                || self
                    .charge_trial_conversion(&subscription, cycle_price)
                    .await?;
            if converted {
                subscription.status = SubscriptionStatus::Active;
                self.subscriptions.update(subscription.clone()).await?;
                sweep.trial_activations += 1;
            } else {
                subscription.status = SubscriptionStatus::Canceled;
                subscription.ends_at = Some(now);
                self.subscriptions.update(subscription.clone()).await?;
                sweep.trial_cancellations += 1;
                self.events.emit(BillingEvent::new(
                    BillingEventType::Canceled,
                    subscription.id,
                    subscription.owner_id,
                    serde_json::json!({ "reason": "trial_expired" }),
                ));
            }
        }

        info!(
            period_end = sweep.period_end_cancellations,
            trial_canceled = sweep.trial_cancellations,
            trial_activated = sweep.trial_activations,
            "expiry sweep complete"
        );
        Ok(sweep)
    }

    /// Bill the first post-trial period on the bound instrument. Returns
    /// whether the charge went through; an unbound subscription has nothing
    /// to attempt.
    async fn charge_trial_conversion(
        &self,
        subscription: &Subscription,
        cycle_price: rust_decimal::Decimal,
    ) -> BillingResult<bool> {
        let Some(instrument_id) = subscription.payment_instrument_id else {
            return Ok(false);
        };

        let period_start = subscription.billing_origin();
        let billing_date = period_start.date_naive();
        if !self
            .billing_ledger
            .claim(subscription.id, billing_date)
            .await?
        {
            // The billing tick got here first; its record decided the period
            // and was already counted as paid_once above.
            return Ok(false);
        }

        let outcome = match self.gateway.charge(instrument_id, cycle_price).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.billing_ledger
                    .release(subscription.id, billing_date)
                    .await?;
                return Err(e.into());
            }
        };

        let period_end = period_start + Months::new(subscription.billing_interval.months());
        match outcome {
            ChargeOutcome::Succeeded { transaction_id } => {
                self.billing_ledger
                    .commit(BillingRecord {
                        subscription_id: subscription.id,
                        amount: cycle_price,
                        billing_date,
                        period_start,
                        period_end,
                        status: BillingRecordStatus::Paid,
                        payment_instrument_id: Some(instrument_id),
                        transaction_id,
                    })
                    .await?;
                info!(
                    subscription_id = %subscription.id,
                    amount = %cycle_price,
                    "trial converted by charging the first period"
                );
                Ok(true)
            }
            ChargeOutcome::Declined { reason } => {
                self.billing_ledger
                    .commit(BillingRecord {
                        subscription_id: subscription.id,
                        amount: cycle_price,
                        billing_date,
                        period_start,
                        period_end,
                        status: BillingRecordStatus::Failed,
                        payment_instrument_id: Some(instrument_id),
                        transaction_id: Uuid::new_v4(),
                    })
                    .await?;
                self.events.emit(BillingEvent::new(
                    BillingEventType::BillingFailed,
                    subscription.id,
                    subscription.owner_id,
                    serde_json::json!({
                        "billing_date": billing_date,
                        "amount": cycle_price,
                        "reason": reason,
                    }),
                ));
                Ok(false)
            }
        }
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryPaymentLedger, PaymentInstrument, PaymentLedger};
    use crate::ledger::InMemoryBillingLedger;
    use crate::plans::InMemoryPlanCatalog;
    use crate::store::InMemorySubscriptionStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Harness {
        service: SubscriptionService,
        subscriptions: Arc<InMemorySubscriptionStore>,
        billing_ledger: Arc<InMemoryBillingLedger>,
        payment_ledger: Arc<InMemoryPaymentLedger>,
    }

    fn harness() -> Harness {
        let catalog = InMemoryPlanCatalog::stock();
        let subscriptions = InMemorySubscriptionStore::new();
        let billing_ledger = InMemoryBillingLedger::new();
        let payment_ledger = InMemoryPaymentLedger::new();
        let gateway = PaymentGateway::new(payment_ledger.clone());
        let service = SubscriptionService::new(
            catalog,
            subscriptions.clone(),
            billing_ledger.clone(),
            gateway,
            Arc::new(crate::events::TracingEventSink),
        );
        Harness {
            service,
            subscriptions,
            billing_ledger,
            payment_ledger,
        }
    }

    async fn funded_card(h: &Harness, balance: rust_decimal::Decimal) -> Uuid {
        let card = PaymentInstrument::funded(balance);
        let id = card.id;
        h.payment_ledger.register_instrument(card).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_subscribe_paid_plan_charges_first_period() {
        let h = harness();
        let card = funded_card(&h, dec!(1000)).await;
        let owner = Uuid::new_v4();

        let sub = h
            .service
            .subscribe(owner, "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        let instrument = h
            .payment_ledger
            .get_instrument(card)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instrument.balance, dec!(500));
        let records = h.billing_ledger.records_for(sub.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, dec!(500));
        assert_eq!(records[0].status, BillingRecordStatus::Paid);
    }

    #[tokio::test]
    async fn test_subscribe_emits_subscribed_event() {
        let mut events = crate::events::MockEventSink::new();
        events
            .expect_emit()
            .withf(|e| e.event_type == BillingEventType::Subscribed)
            .times(1)
            .return_const(());

        let payment_ledger = InMemoryPaymentLedger::new();
        let service = SubscriptionService::new(
            InMemoryPlanCatalog::stock(),
            InMemorySubscriptionStore::new(),
            InMemoryBillingLedger::new(),
            PaymentGateway::new(payment_ledger),
            Arc::new(events),
        );

        service
            .subscribe(Uuid::new_v4(), "free", None, BillingInterval::Monthly)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_trial_plan_charges_nothing() {
        let h = harness();
        let owner = Uuid::new_v4();

        let sub = h
            .service
            .subscribe(owner, "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(sub.trial_ends_at.is_some());
        assert!(h
            .billing_ledger
            .records_for(sub.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            h.payment_ledger.merchant_balance().await.unwrap(),
            rust_decimal::Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_subscribe_free_plan_is_active_without_instrument() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "free", None, BillingInterval::Monthly)
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_plan() {
        let h = harness();
        let err = h
            .service
            .subscribe(Uuid::new_v4(), "platinum", None, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let h = harness();
        let owner = Uuid::new_v4();
        h.service
            .subscribe(owner, "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        let err = h
            .service
            .subscribe(owner, "free", None, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn test_declined_subscribe_leaves_no_trace() {
        let h = harness();
        let card = funded_card(&h, dec!(10)).await; // not enough for premium
        let owner = Uuid::new_v4();

        let err = h
            .service
            .subscribe(owner, "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::PaymentDeclined(crate::error::DeclineReason::InsufficientFunds)
        ));

        // Neither store shows the attempt happened
        assert!(h.subscriptions.list_all().await.unwrap().is_empty());
        assert_eq!(
            h.payment_ledger.merchant_balance().await.unwrap(),
            rust_decimal::Decimal::ZERO
        );
        // The owner can immediately try again with a funded card
        let card2 = funded_card(&h, dec!(1000)).await;
        h.service
            .subscribe(owner, "premium", Some(card2), BillingInterval::Monthly)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_paid_plan_without_instrument_rejected() {
        let h = harness();
        let err = h
            .service
            .subscribe(Uuid::new_v4(), "premium", None, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InstrumentRequired));
    }

    #[tokio::test]
    async fn test_cancel_immediately() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        let canceled = h.service.cancel(sub.id, true).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.ends_at.is_some());
        assert!(canceled.has_ended(Utc::now()));
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_stays_billable() {
        let h = harness();
        let card = funded_card(&h, dec!(1000)).await;
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        let canceled = h.service.cancel(sub.id, false).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Active);
        let ends_at = canceled.ends_at.unwrap();
        assert!(ends_at > Utc::now());
    }

    #[tokio::test]
    async fn test_resume_before_period_end() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();
        h.service.cancel(sub.id, false).await.unwrap();

        let resumed = h.service.resume(sub.id).await.unwrap();
        assert!(resumed.ends_at.is_none());
        // Trial window still open, so the status stays trialing
        assert_eq!(resumed.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn test_resume_after_immediate_cancel_fails() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();
        h.service.cancel(sub.id, true).await.unwrap();

        let err = h.service.resume(sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::CannotResume));
    }

    #[tokio::test]
    async fn test_resume_without_pending_cancel_fails() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        let err = h.service.resume(sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::CannotResume));
    }

    #[tokio::test]
    async fn test_upgrade_swap_charges_proration() {
        let h = harness();
        let card = funded_card(&h, dec!(2000)).await;
        let owner = Uuid::new_v4();
        let sub = h
            .service
            .subscribe(owner, "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();
        let after_subscribe = h
            .payment_ledger
            .get_instrument(card)
            .await
            .unwrap()
            .unwrap()
            .balance;

        let swapped = h
            .service
            .swap(sub.id, "practice", Some(card))
            .await
            .unwrap();
        assert_eq!(swapped.plan_slug, "practice");

        // Freshly subscribed, so a full period (28-31 days against the
        // 30-day model) remains: charge is the 300 diff scaled accordingly.
        let after_swap = h
            .payment_ledger
            .get_instrument(card)
            .await
            .unwrap()
            .unwrap()
            .balance;
        let charged = after_subscribe - after_swap;
        assert!(charged >= dec!(280) && charged <= dec!(310));
    }

    #[tokio::test]
    async fn test_downgrade_swap_is_free_and_keeps_money() {
        let h = harness();
        let card = funded_card(&h, dec!(2000)).await;
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();
        let merchant_before = h.payment_ledger.merchant_balance().await.unwrap();

        let swapped = h.service.swap(sub.id, "basic", Some(card)).await.unwrap();
        assert_eq!(swapped.plan_slug, "basic");
        // No charge and no refund on downgrade
        assert_eq!(
            h.payment_ledger.merchant_balance().await.unwrap(),
            merchant_before
        );
    }

    #[tokio::test]
    async fn test_declined_swap_keeps_old_plan() {
        let h = harness();
        let card = funded_card(&h, dec!(510)).await; // covers subscribe only
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "premium", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        let err = h
            .service
            .swap(sub.id, "practice", Some(card))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentDeclined(_)));

        let unchanged = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(unchanged.plan_slug, "premium");
    }

    #[tokio::test]
    async fn test_swap_on_canceled_subscription_rejected() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();
        h.service.cancel(sub.id, true).await.unwrap();

        let err = h.service.swap(sub.id, "premium", None).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionEnded));
    }

    #[tokio::test]
    async fn test_preview_swap_reports_days_remaining() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        let preview = h.service.preview_swap(sub.id, "premium").await.unwrap();
        assert_eq!(preview.current_plan, "basic");
        assert_eq!(preview.new_plan, "premium");
        assert!(preview.amount > rust_decimal::Decimal::ZERO);
        assert!(preview.days_remaining <= 14); // trial period is the current period
    }

    #[tokio::test]
    async fn test_sweep_cancels_after_period_end() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();
        h.service.cancel(sub.id, false).await.unwrap();

        // Nothing happens while ends_at is in the future
        let sweep = h.service.finalize_expirations(Utc::now()).await.unwrap();
        assert_eq!(sweep.period_end_cancellations, 0);

        // Jump past the scheduled end
        let sweep = h
            .service
            .finalize_expirations(Utc::now() + Duration::days(20))
            .await
            .unwrap();
        assert_eq!(sweep.period_end_cancellations, 1);
        let after = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_sweep_cancels_expired_unpaid_trial() {
        let h = harness();
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", None, BillingInterval::Monthly)
            .await
            .unwrap();

        let sweep = h
            .service
            .finalize_expirations(Utc::now() + Duration::days(15))
            .await
            .unwrap();
        assert_eq!(sweep.trial_cancellations, 1);
        let after = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceled);
        assert!(after.ends_at.is_some());
    }

    #[tokio::test]
    async fn test_sweep_activates_paid_trial() {
        let h = harness();
        let card = funded_card(&h, dec!(1000)).await;
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        // Simulate the generator having billed the first post-trial period
        let date = Utc::now().date_naive();
        assert!(h.billing_ledger.claim(sub.id, date).await.unwrap());
        h.billing_ledger
            .commit(BillingRecord {
                subscription_id: sub.id,
                amount: dec!(300),
                billing_date: date,
                period_start: sub.billing_origin(),
                period_end: sub.billing_origin() + Months::new(1),
                status: BillingRecordStatus::Paid,
                payment_instrument_id: Some(card),
                transaction_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        let sweep = h
            .service
            .finalize_expirations(Utc::now() + Duration::days(15))
            .await
            .unwrap();
        assert_eq!(sweep.trial_activations, 1);
        let after = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_sweep_converts_trial_by_charging_first_period() {
        let h = harness();
        let card = funded_card(&h, dec!(1000)).await;
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        // The sweep reaches the expired trial before any billing tick does
        let sweep = h
            .service
            .finalize_expirations(Utc::now() + Duration::days(15))
            .await
            .unwrap();
        assert_eq!(sweep.trial_activations, 1);
        assert_eq!(sweep.trial_cancellations, 0);

        let after = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);

        let records = h.billing_ledger.records_for(sub.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BillingRecordStatus::Paid);
        assert_eq!(records[0].amount, dec!(300));
        assert_eq!(
            records[0].billing_date,
            sub.trial_ends_at.unwrap().date_naive()
        );
    }

    #[tokio::test]
    async fn test_sweep_cancels_trial_when_conversion_declines() {
        let h = harness();
        let card = funded_card(&h, dec!(10)).await; // cannot cover basic
        let sub = h
            .service
            .subscribe(Uuid::new_v4(), "basic", Some(card), BillingInterval::Monthly)
            .await
            .unwrap();

        let sweep = h
            .service
            .finalize_expirations(Utc::now() + Duration::days(15))
            .await
            .unwrap();
        assert_eq!(sweep.trial_cancellations, 1);

        let after = h.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceled);
        let records = h.billing_ledger.records_for(sub.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BillingRecordStatus::Failed);
    }

    #[test]
    fn test_current_period_end_walks_boundaries() {
        let created = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let sub = Subscription {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            plan_slug: "premium".into(),
            status: SubscriptionStatus::Active,
            billing_interval: BillingInterval::Monthly,
            payment_instrument_id: None,
            trial_ends_at: None,
            ends_at: None,
            created_at: created,
        };

        let mid_feb = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap();
        assert_eq!(
            sub.current_period_end(mid_feb),
            Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()
        );
        assert_eq!(
            sub.current_period_start(mid_feb),
            Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap())
        );
        // On the boundary itself the new period has started
        assert_eq!(
            sub.current_period_start(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap())
        );
        // Before the timeline starts nothing is due
        assert_eq!(
            sub.current_period_start(Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()),
            None
        );
    }
}
