//! Shared vocabulary types for the Pawsly billing core.
//!
//! These enums are the wire-stable names used across the billing crate, the
//! worker, and anything else that consumes billing events or reports.

pub mod types;

pub use types::{BillingInterval, PaymentMethod, SubscriptionStatus};
