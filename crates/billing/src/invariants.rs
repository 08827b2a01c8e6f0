//! Billing invariants
//!
//! Runnable consistency checks over the subscription store and the two
//! ledgers. The scheduled audit job runs these after every billing tick;
//! they only read, never repair.
//!
//! Each check has a stable name so a single invariant can be re-run in
//! isolation while debugging.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use pawsly_shared::SubscriptionStatus;

use crate::error::BillingResult;
use crate::gateway::PaymentLedger;
use crate::ledger::{BillingLedger, BillingRecordStatus};
use crate::store::SubscriptionStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscription, owner, or instrument ids involved
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// System may be charging incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    subscriptions: Arc<dyn SubscriptionStore>,
    billing_ledger: Arc<dyn BillingLedger>,
    payment_ledger: Arc<dyn PaymentLedger>,
}

impl InvariantChecker {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        billing_ledger: Arc<dyn BillingLedger>,
        payment_ledger: Arc<dyn PaymentLedger>,
    ) -> Self {
        Self {
            subscriptions,
            billing_ledger,
            payment_ledger,
        }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        violations.extend(self.check_single_subscription_per_owner().await?);
        violations.extend(self.check_canceled_has_ends_at().await?);
        violations.extend(self.check_trialing_has_open_trial().await?);
        violations.extend(self.check_non_negative_balances().await?);
        violations.extend(self.check_paid_total_covered().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one non-canceled subscription per owner.
    ///
    /// A second live subscription would double-bill the owner.
    async fn check_single_subscription_per_owner(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut per_owner: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for subscription in self.subscriptions.list_all().await? {
            if subscription.status.is_non_canceled() {
                per_owner
                    .entry(subscription.owner_id)
                    .or_default()
                    .push(subscription.id);
            }
        }

        Ok(per_owner
            .into_iter()
            .filter(|(_, subs)| subs.len() > 1)
            .map(|(owner_id, subs)| InvariantViolation {
                invariant: "single_subscription_per_owner".to_string(),
                subject_ids: vec![owner_id],
                description: format!(
                    "Owner has {} non-canceled subscriptions (expected at most 1)",
                    subs.len()
                ),
                context: serde_json::json!({ "subscription_ids": subs }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: canceled subscriptions carry an end timestamp.
    ///
    /// Without `ends_at` there is no record of when access ended.
    async fn check_canceled_has_ends_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .subscriptions
            .list_all()
            .await?
            .into_iter()
            .filter(|s| s.status == SubscriptionStatus::Canceled && s.ends_at.is_none())
            .map(|s| InvariantViolation {
                invariant: "canceled_has_ends_at".to_string(),
                subject_ids: vec![s.id],
                description: "Canceled subscription has no ends_at timestamp".to_string(),
                context: serde_json::json!({ "owner_id": s.owner_id, "plan": s.plan_slug }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: trialing subscriptions have a trial window that is still
    /// open. An expired trial should have been activated or canceled by the
    /// expiry sweep.
    async fn check_trialing_has_open_trial(&self) -> BillingResult<Vec<InvariantViolation>> {
        let now = Utc::now();
        Ok(self
            .subscriptions
            .list_all()
            .await?
            .into_iter()
            .filter(|s| {
                s.status == SubscriptionStatus::Trialing
                    && !s.trial_ends_at.is_some_and(|t| t > now)
            })
            .map(|s| InvariantViolation {
                invariant: "trialing_has_open_trial".to_string(),
                subject_ids: vec![s.id],
                description: "Trialing subscription has no open trial window".to_string(),
                context: serde_json::json!({
                    "owner_id": s.owner_id,
                    "trial_ends_at": s.trial_ends_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: no instrument balance below zero.
    ///
    /// The gateway never overdraws; a negative balance means money appeared
    /// from nowhere on the merchant side.
    async fn check_non_negative_balances(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .payment_ledger
            .list_instruments()
            .await?
            .into_iter()
            .filter(|i| i.balance < Decimal::ZERO)
            .map(|i| InvariantViolation {
                invariant: "non_negative_balances".to_string(),
                subject_ids: vec![i.id],
                description: format!("Instrument balance is negative ({})", i.balance),
                context: serde_json::json!({ "balance": i.balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: the merchant account covers all paid ledger entries.
    ///
    /// Every paid record moved its amount to the merchant account, and
    /// proration charges only add on top, so the merchant balance can never
    /// be below the paid total.
    async fn check_paid_total_covered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let paid_total: Decimal = self
            .billing_ledger
            .list_by_status(BillingRecordStatus::Paid)
            .await?
            .iter()
            .map(|r| r.amount)
            .sum();
        let merchant_balance = self.payment_ledger.merchant_balance().await?;

        if merchant_balance >= paid_total {
            return Ok(vec![]);
        }
        Ok(vec![InvariantViolation {
            invariant: "paid_total_covered".to_string(),
            subject_ids: vec![],
            description: format!(
                "Merchant balance {merchant_balance} is below the paid ledger total {paid_total}"
            ),
            context: serde_json::json!({
                "merchant_balance": merchant_balance,
                "paid_total": paid_total,
            }),
            severity: ViolationSeverity::Critical,
        }])
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_owner" => self.check_single_subscription_per_owner().await,
            "canceled_has_ends_at" => self.check_canceled_has_ends_at().await,
            "trialing_has_open_trial" => self.check_trialing_has_open_trial().await,
            "non_negative_balances" => self.check_non_negative_balances().await,
            "paid_total_covered" => self.check_paid_total_covered().await,
            _ => Ok(vec![]),
        }
    }

    /// List of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_subscription_per_owner",
            "canceled_has_ends_at",
            "trialing_has_open_trial",
            "non_negative_balances",
            "paid_total_covered",
        ]
    }
}
