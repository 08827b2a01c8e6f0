//! Revenue aggregation
//!
//! Read-only reporting over the subscription store and billing ledger.
//! Collected revenue comes from paid ledger entries; recurring metrics (MRR,
//! ARR) come from what current non-ended subscriptions would bill, with
//! annual plans normalized to a monthly figure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use pawsly_shared::BillingInterval;

use crate::error::BillingResult;
use crate::ledger::{BillingLedger, BillingRecordStatus};
use crate::plans::PlanCatalog;
use crate::store::SubscriptionStore;
use crate::subscriptions::Subscription;

/// Snapshot of the headline metrics, shaped for the reporting job's log line
#[derive(Debug, Clone, Serialize)]
pub struct RevenueReport {
    pub total_revenue: Decimal,
    pub month_to_date_revenue: Decimal,
    pub mrr: Decimal,
    pub arr: Decimal,
    pub growth_percentage: Decimal,
    pub plan_distribution: HashMap<String, usize>,
}

/// Aggregates revenue metrics from the ledgers
pub struct RevenueService {
    catalog: Arc<dyn PlanCatalog>,
    subscriptions: Arc<dyn SubscriptionStore>,
    billing_ledger: Arc<dyn BillingLedger>,
}

impl RevenueService {
    pub fn new(
        catalog: Arc<dyn PlanCatalog>,
        subscriptions: Arc<dyn SubscriptionStore>,
        billing_ledger: Arc<dyn BillingLedger>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            billing_ledger,
        }
    }

    /// Money actually collected: the sum of all paid ledger entries.
    pub async fn total_revenue(&self) -> BillingResult<Decimal> {
        let paid = self
            .billing_ledger
            .list_by_status(BillingRecordStatus::Paid)
            .await?;
        Ok(paid.iter().map(|r| r.amount).sum())
    }

    /// Monthly recurring revenue: each revenue-bearing, non-ended
    /// subscription contributes its monthly price, with annual plans counted
    /// at one twelfth.
    pub async fn mrr(&self) -> BillingResult<Decimal> {
        let now = Utc::now();
        let mut total = Decimal::ZERO;
        for subscription in self.subscriptions.list_all().await? {
            if !self.counts_toward_mrr(&subscription, now) {
                continue;
            }
            let plan = self.catalog.get_or_free(&subscription.plan_slug).await?;
            let monthly = match subscription.billing_interval {
                BillingInterval::Monthly => plan.monthly_price,
                BillingInterval::Annual => (plan.annual_price / Decimal::from(12)).round_dp(2),
            };
            total += monthly;
        }
        Ok(total)
    }

    /// Money collected in `[from, to)`, summed over paid entries dated in
    /// the window.
    pub async fn revenue_between(&self, from: NaiveDate, to: NaiveDate) -> BillingResult<Decimal> {
        let records = self.billing_ledger.list_in_range(from, to).await?;
        Ok(records
            .iter()
            .filter(|r| r.status == BillingRecordStatus::Paid)
            .map(|r| r.amount)
            .sum())
    }

    /// Annualized recurring revenue, defined as `mrr * 12`.
    pub async fn arr(&self) -> BillingResult<Decimal> {
        Ok(self.mrr().await? * Decimal::from(12))
    }

    /// Percentage of the subscriptions alive at `period_start` that ended
    /// within `[period_start, period_end)`. Zero when nothing was alive at
    /// the start.
    pub async fn churn_rate(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Decimal> {
        let subscriptions = self.subscriptions.list_all().await?;

        let alive_at_start = subscriptions
            .iter()
            .filter(|s| s.created_at < period_start && !s.has_ended(period_start))
            .count();
        if alive_at_start == 0 {
            return Ok(Decimal::ZERO);
        }

        let churned = subscriptions
            .iter()
            .filter(|s| s.created_at < period_start)
            .filter(|s| {
                s.ends_at
                    .is_some_and(|e| e >= period_start && e < period_end)
            })
            .count();

        Ok(
            (Decimal::from(churned) / Decimal::from(alive_at_start) * Decimal::from(100))
                .round_dp(2),
        )
    }

    /// Month-over-month growth in new subscriptions: this calendar month
    /// against the previous one. A first month with any signups reports 100.
    pub async fn growth_percentage(&self) -> BillingResult<Decimal> {
        let today = Utc::now().date_naive();
        let this_month = first_of_month(today);
        let previous_month = previous_month_start(this_month);

        let mut current = 0u32;
        let mut previous = 0u32;
        for subscription in self.subscriptions.list_all().await? {
            let created = subscription.created_at.date_naive();
            if created >= this_month {
                current += 1;
            } else if created >= previous_month {
                previous += 1;
            }
        }

        if previous == 0 {
            return Ok(if current > 0 {
                Decimal::from(100)
            } else {
                Decimal::ZERO
            });
        }
        let previous = Decimal::from(previous);
        Ok(
            ((Decimal::from(current) - previous) / previous * Decimal::from(100)).round_dp(2),
        )
    }

    /// Count of non-canceled subscriptions per plan slug.
    pub async fn plan_distribution(&self) -> BillingResult<HashMap<String, usize>> {
        let mut distribution: HashMap<String, usize> = HashMap::new();
        for subscription in self.subscriptions.list_all().await? {
            if subscription.status.is_non_canceled() {
                *distribution.entry(subscription.plan_slug).or_default() += 1;
            }
        }
        Ok(distribution)
    }

    /// The full snapshot in one call, for the periodic reporting job.
    pub async fn report(&self) -> BillingResult<RevenueReport> {
        let mrr = self.mrr().await?;
        let today = Utc::now().date_naive();
        let month_to_date_revenue = self
            .revenue_between(first_of_month(today), today.succ_opt().unwrap_or(today))
            .await?;
        Ok(RevenueReport {
            total_revenue: self.total_revenue().await?,
            month_to_date_revenue,
            mrr,
            arr: mrr * Decimal::from(12),
            growth_percentage: self.growth_percentage().await?,
            plan_distribution: self.plan_distribution().await?,
        })
    }

    fn counts_toward_mrr(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.status.is_revenue_bearing()
            && subscription.ends_at.is_none_or(|e| e > now)
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    // The first of any valid date's month always exists
    date.with_day(1).unwrap_or(date)
}

fn previous_month_start(this_month: NaiveDate) -> NaiveDate {
    let (year, month) = if this_month.month() == 1 {
        (this_month.year() - 1, 12)
    } else {
        (this_month.year(), this_month.month() - 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(this_month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BillingRecord, InMemoryBillingLedger};
    use crate::plans::InMemoryPlanCatalog;
    use crate::store::InMemorySubscriptionStore;
    use chrono::Duration;
    use pawsly_shared::SubscriptionStatus;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Harness {
        revenue: RevenueService,
        subscriptions: Arc<InMemorySubscriptionStore>,
        billing_ledger: Arc<InMemoryBillingLedger>,
    }

    fn harness() -> Harness {
        let catalog = InMemoryPlanCatalog::stock();
        let subscriptions = InMemorySubscriptionStore::new();
        let billing_ledger = InMemoryBillingLedger::new();
        let revenue = RevenueService::new(catalog, subscriptions.clone(), billing_ledger.clone());
        Harness {
            revenue,
            subscriptions,
            billing_ledger,
        }
    }

    async fn seed_subscription(
        h: &Harness,
        plan_slug: &str,
        status: SubscriptionStatus,
        interval: BillingInterval,
        created_days_ago: i64,
        ends_at: Option<DateTime<Utc>>,
    ) -> Subscription {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            plan_slug: plan_slug.to_string(),
            status,
            billing_interval: interval,
            payment_instrument_id: None,
            trial_ends_at: None,
            ends_at,
            created_at: Utc::now() - Duration::days(created_days_ago),
        };
        h.subscriptions.insert(subscription.clone()).await.unwrap();
        subscription
    }

    async fn seed_paid_record(h: &Harness, subscription_id: Uuid, amount: Decimal, days_ago: i64) {
        let at = Utc::now() - Duration::days(days_ago);
        let date = at.date_naive();
        assert!(h.billing_ledger.claim(subscription_id, date).await.unwrap());
        h.billing_ledger
            .commit(BillingRecord {
                subscription_id,
                amount,
                billing_date: date,
                period_start: at,
                period_end: at + chrono::Months::new(1),
                status: BillingRecordStatus::Paid,
                payment_instrument_id: Some(Uuid::new_v4()),
                transaction_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_metrics_tolerate_empty_stores() {
        let h = harness();
        assert_eq!(h.revenue.total_revenue().await.unwrap(), Decimal::ZERO);
        assert_eq!(h.revenue.mrr().await.unwrap(), Decimal::ZERO);
        assert_eq!(h.revenue.arr().await.unwrap(), Decimal::ZERO);
        assert_eq!(h.revenue.growth_percentage().await.unwrap(), Decimal::ZERO);
        assert!(h.revenue.plan_distribution().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_total_revenue_sums_paid_only() {
        let h = harness();
        let sub = seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            60,
            None,
        )
        .await;
        seed_paid_record(&h, sub.id, dec!(500), 40).await;
        seed_paid_record(&h, sub.id, dec!(500), 10).await;

        // A failed attempt in between contributes nothing
        let failed_date = (Utc::now() - Duration::days(25)).date_naive();
        assert!(h.billing_ledger.claim(sub.id, failed_date).await.unwrap());
        h.billing_ledger
            .commit(BillingRecord {
                subscription_id: sub.id,
                amount: dec!(500),
                billing_date: failed_date,
                period_start: Utc::now() - Duration::days(25),
                period_end: Utc::now() + Duration::days(5),
                status: BillingRecordStatus::Failed,
                payment_instrument_id: None,
                transaction_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        assert_eq!(h.revenue.total_revenue().await.unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn test_revenue_between_windows_paid_entries() {
        let h = harness();
        let sub = seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            60,
            None,
        )
        .await;
        seed_paid_record(&h, sub.id, dec!(500), 40).await;
        seed_paid_record(&h, sub.id, dec!(500), 10).await;

        // Half-open window: the 40-day-old entry falls outside it
        let today = Utc::now().date_naive();
        let window = h
            .revenue
            .revenue_between(today - Duration::days(15), today)
            .await
            .unwrap();
        assert_eq!(window, dec!(500));

        let report = h.revenue.report().await.unwrap();
        assert_eq!(report.total_revenue, dec!(1000));
        assert!(report.month_to_date_revenue <= report.total_revenue);
    }

    #[tokio::test]
    async fn test_mrr_normalizes_annual_plans() {
        let h = harness();
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            10,
            None,
        )
        .await;
        // 5000 / 12 = 416.67
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Active,
            BillingInterval::Annual,
            10,
            None,
        )
        .await;

        assert_eq!(h.revenue.mrr().await.unwrap(), dec!(916.67));
        assert_eq!(h.revenue.arr().await.unwrap(), dec!(11000.04));
    }

    #[tokio::test]
    async fn test_mrr_excludes_past_due_canceled_and_ending() {
        let h = harness();
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::PastDue,
            BillingInterval::Monthly,
            10,
            None,
        )
        .await;
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Canceled,
            BillingInterval::Monthly,
            10,
            Some(Utc::now() - Duration::days(1)),
        )
        .await;
        // Active but past its scheduled end, waiting on the expiry sweep
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            40,
            Some(Utc::now() - Duration::days(1)),
        )
        .await;

        assert_eq!(h.revenue.mrr().await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_trialing_counts_toward_mrr() {
        let h = harness();
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Trialing,
            BillingInterval::Monthly,
            1,
            None,
        )
        .await;
        assert_eq!(h.revenue.mrr().await.unwrap(), dec!(300));
    }

    #[tokio::test]
    async fn test_churn_rate_over_window() {
        let h = harness();
        let period_start = Utc::now() - Duration::days(30);
        let period_end = Utc::now();

        // Four alive at period start, one of them ended inside the window
        for _ in 0..3 {
            seed_subscription(
                &h,
                "premium",
                SubscriptionStatus::Active,
                BillingInterval::Monthly,
                60,
                None,
            )
            .await;
        }
        seed_subscription(
            &h,
            "premium",
            SubscriptionStatus::Canceled,
            BillingInterval::Monthly,
            60,
            Some(Utc::now() - Duration::days(15)),
        )
        .await;
        // Created inside the window: not part of the starting cohort
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            5,
            None,
        )
        .await;

        assert_eq!(
            h.revenue.churn_rate(period_start, period_end).await.unwrap(),
            dec!(25.00)
        );
    }

    #[tokio::test]
    async fn test_churn_rate_empty_cohort_is_zero() {
        let h = harness();
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            5,
            None,
        )
        .await;
        // Everything was created after the window started
        let rate = h
            .revenue
            .churn_rate(Utc::now() - Duration::days(30), Utc::now())
            .await
            .unwrap();
        assert_eq!(rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_growth_first_month_with_signups_is_hundred() {
        let h = harness();
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Active,
            BillingInterval::Monthly,
            0,
            None,
        )
        .await;
        assert_eq!(h.revenue.growth_percentage().await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_plan_distribution_skips_canceled() {
        let h = harness();
        for _ in 0..2 {
            seed_subscription(
                &h,
                "premium",
                SubscriptionStatus::Active,
                BillingInterval::Monthly,
                10,
                None,
            )
            .await;
        }
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Trialing,
            BillingInterval::Monthly,
            2,
            None,
        )
        .await;
        seed_subscription(
            &h,
            "basic",
            SubscriptionStatus::Canceled,
            BillingInterval::Monthly,
            50,
            Some(Utc::now() - Duration::days(20)),
        )
        .await;

        let distribution = h.revenue.plan_distribution().await.unwrap();
        assert_eq!(distribution.get("premium"), Some(&2));
        assert_eq!(distribution.get("basic"), Some(&1));
        assert_eq!(distribution.len(), 2);
    }

    #[test]
    fn test_previous_month_start_wraps_january() {
        let jan = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(
            previous_month_start(jan),
            NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()
        );
    }
}
