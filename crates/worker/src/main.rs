//! Pawsly Billing Worker
//!
//! Runs the billing simulation end to end on scheduled jobs:
//! - Billing tick: settle the current cycle for every live subscription
//!   (every 5 minutes)
//! - Expiry sweep: finalize period-end cancellations and expired trials
//!   (hourly)
//! - Invariant audit: consistency checks over stores and ledgers (every
//!   6 hours)
//! - Revenue report: collected revenue, MRR/ARR, growth, plan distribution
//!   (daily at 23:55 UTC)
//! - Instrument top-up: simulated payday deposits so past_due subscriptions
//!   can recover (daily at 00:30 UTC)
//!
//! The whole state is in-memory; the seed step creates a cohort of
//! subscribers with funded instruments so the jobs have something to chew on.

use std::sync::Arc;
use std::time::Duration;

use pawsly_billing::{BillingService, PaymentInstrument, TracingEventSink};
use pawsly_shared::BillingInterval;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Seed a cohort of subscribers with funded instruments.
///
/// Balances are staggered so some instruments run dry after a few cycles,
/// which is what exercises the past_due path. Returns how many subscriptions
/// were created; declined signups are logged and skipped.
async fn seed_simulation(billing: &BillingService) -> anyhow::Result<usize> {
    let subscriber_count = env_usize("SIM_SUBSCRIBERS", 25);
    let plans = ["free", "basic", "premium", "practice"];
    let intervals = [
        BillingInterval::Monthly,
        BillingInterval::Monthly,
        BillingInterval::Annual,
    ];

    let mut created = 0;
    for i in 0..subscriber_count {
        let balance = dec!(400) + Decimal::from(i as u64) * dec!(275);
        let card = PaymentInstrument::funded(balance);
        let card_id = card.id;
        billing.gateway.ledger().register_instrument(card).await?;

        let plan = plans[i % plans.len()];
        let interval = intervals[i % intervals.len()];
        match billing
            .subscriptions
            .subscribe(Uuid::new_v4(), plan, Some(card_id), interval)
            .await
        {
            Ok(subscription) => {
                created += 1;
                // A few period-end cancellations so the sweep has work
                if i % 7 == 6 {
                    billing.subscriptions.cancel(subscription.id, false).await?;
                }
            }
            Err(e) => warn!(plan, error = %e, "seed signup declined"),
        }
    }

    info!(created, subscriber_count, "simulation cohort seeded");
    Ok(created)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Pawsly Billing Worker");

    let billing = Arc::new(BillingService::in_memory(Arc::new(TracingEventSink)));
    seed_simulation(&billing).await?;

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing tick (every 5 minutes)
    // Settles the current cycle for every non-canceled subscription
    let tick_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = tick_billing.clone();
            Box::pin(async move {
                info!("Running billing tick");

                let subscriptions = match billing.store.list_all().await {
                    Ok(subs) => subs,
                    Err(e) => {
                        error!(error = %e, "Billing tick failed to list subscriptions");
                        return;
                    }
                };

                let mut charged = 0;
                let mut skipped = 0;
                let mut errors = 0;
                for subscription in subscriptions {
                    if !subscription.status.is_non_canceled() {
                        continue;
                    }
                    match billing.generator.process_billing(subscription.id).await {
                        Ok(true) => charged += 1,
                        Ok(false) => skipped += 1,
                        Err(e) => {
                            error!(
                                subscription_id = %subscription.id,
                                error = %e,
                                "Billing tick failed for subscription"
                            );
                            errors += 1;
                        }
                    }
                }

                info!(charged, skipped, errors, "Billing tick complete");
            })
        })?)
        .await?;
    info!("Scheduled: Billing tick (every 5 minutes)");

    // Job 2: Expiry sweep (hourly)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running expiry sweep");
                match billing
                    .subscriptions
                    .finalize_expirations(chrono::Utc::now())
                    .await
                {
                    Ok(sweep) => info!(
                        period_end = sweep.period_end_cancellations,
                        trial_canceled = sweep.trial_cancellations,
                        trial_activated = sweep.trial_activations,
                        "Expiry sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (hourly)");

    // Job 3: Invariant audit (every 6 hours)
    let audit_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let billing = audit_billing.clone();
            Box::pin(async move {
                info!("Running invariant audit");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "Invariant audit healthy");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Invariant violated"
                            );
                        }
                        error!(
                            failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Invariant audit found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant audit failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant audit (every 6 hours)");

    // Job 4: Revenue report (daily at 23:55 UTC)
    let report_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 55 23 * * *", move |_uuid, _l| {
            let billing = report_billing.clone();
            Box::pin(async move {
                info!("Running daily revenue report");
                match billing.revenue.report().await {
                    Ok(report) => info!(
                        total_revenue = %report.total_revenue,
                        month_to_date = %report.month_to_date_revenue,
                        mrr = %report.mrr,
                        arr = %report.arr,
                        growth_percentage = %report.growth_percentage,
                        plans = ?report.plan_distribution,
                        "Daily revenue report"
                    ),
                    Err(e) => error!(error = %e, "Revenue report failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Revenue report (daily at 23:55 UTC)");

    // Job 5: Instrument top-up (daily at 00:30 UTC)
    // Simulated payday; lets past_due subscriptions recover on the next tick
    let topup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 0 * * *", move |_uuid, _l| {
            let billing = topup_billing.clone();
            let amount = Decimal::from(env_usize("SIM_TOPUP", 500) as u64);
            Box::pin(async move {
                let ledger = billing.gateway.ledger();
                let instruments = match ledger.list_instruments().await {
                    Ok(instruments) => instruments,
                    Err(e) => {
                        error!(error = %e, "Top-up failed to list instruments");
                        return;
                    }
                };

                let mut topped_up = 0;
                for instrument in instruments {
                    if instrument.is_blocked {
                        continue;
                    }
                    match ledger.deposit(instrument.id, amount).await {
                        Ok(()) => topped_up += 1,
                        Err(e) => {
                            error!(instrument_id = %instrument.id, error = %e, "Top-up failed")
                        }
                    }
                }
                info!(topped_up, %amount, "Instrument top-up complete");
            })
        })?)
        .await?;
    info!("Scheduled: Instrument top-up (daily at 00:30 UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Pawsly Billing Worker started successfully with 5 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
