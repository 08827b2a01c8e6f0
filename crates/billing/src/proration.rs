//! Mid-cycle proration
//!
//! Linear 30-day-month model: an upgrade pays the price difference scaled by
//! the days left in the current period. Downgrades and lateral moves owe
//! nothing; no credit or refund is issued.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Days assumed per billing month for proration purposes
pub const PRORATION_MONTH_DAYS: i64 = 30;

/// Charge owed when moving from a plan priced `old_price` to one priced
/// `new_price` with the current period ending at `period_end`.
///
/// Always `>= 0`:
/// - non-positive price difference -> 0
/// - no days remaining -> the full difference (nothing left to prorate)
/// - otherwise `round(diff / 30 * remaining_days, 2)`
pub fn prorate(
    old_price: Decimal,
    new_price: Decimal,
    now: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Decimal {
    let price_diff = new_price - old_price;
    if price_diff <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let remaining_days = days_between(now, period_end);
    if remaining_days == 0 {
        return price_diff;
    }

    (price_diff / Decimal::from(PRORATION_MONTH_DAYS) * Decimal::from(remaining_days)).round_dp(2)
}

/// Whole days from `now` to `period_end`, clamped at zero
pub fn days_between(now: DateTime<Utc>, period_end: DateTime<Utc>) -> i64 {
    (period_end - now).num_days().max(0)
}

/// Preview of what a plan swap would charge, for display before committing
#[derive(Debug, Clone, Serialize)]
pub struct ProrationPreview {
    pub current_plan: String,
    pub new_plan: String,
    /// Amount that would be charged on swap (0 for downgrades)
    pub amount: Decimal,
    pub days_remaining: i64,
    /// Human-readable description of the proration
    pub description: String,
}

impl ProrationPreview {
    pub fn new(
        current_plan: &str,
        new_plan: &str,
        amount: Decimal,
        days_remaining: i64,
    ) -> Self {
        let description = if amount.is_zero() {
            format!(
                "Switching from {current_plan} to {new_plan} costs nothing now; \
                 the new price applies from the next billing date."
            )
        } else {
            format!(
                "Upgrading from {current_plan} to {new_plan} charges {amount} \
                 for the {days_remaining} day(s) left in the current period."
            )
        };
        Self {
            current_plan: current_plan.to_string(),
            new_plan: new_plan.to_string(),
            amount,
            days_remaining,
            description,
        }
    }
}
