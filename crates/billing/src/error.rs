//! Error types for the billing core
//!
//! Two families are deliberately kept apart:
//!
//! - [`BillingError`]: caller input/state errors and hard failures. A decline
//!   during `subscribe`/`swap` surfaces here because the whole operation is
//!   rejected and rolled back.
//! - [`DeclineReason`]: gateway declines. A decline is an expected business
//!   outcome, so gateway calls return it inside a successful `ChargeOutcome`
//!   rather than as an `Err`.
//!
//! [`StoreError`] marks transient store failures; callers such as the billing
//! scheduler may retry those, unlike declines and input errors.

use thiserror::Error;

/// Why the payment gateway declined a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// Instrument id is unknown or not registered with the gateway
    UnregisteredInstrument,
    /// Instrument is flagged as an always-decline test card
    CardDeclined,
    /// Instrument balance is lower than the charge amount
    InsufficientFunds,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::UnregisteredInstrument => "unregistered_instrument",
            DeclineReason::CardDeclined => "card_declined",
            DeclineReason::InsufficientFunds => "insufficient_funds",
        }
    }
}

impl std::fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transient failure in one of the backing stores.
///
/// Distinct from a decline: the operation was rolled back in full and the
/// caller may retry immediately.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Billing operation errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("owner {0} already holds a non-canceled subscription")]
    AlreadySubscribed(uuid::Uuid),

    #[error("subscription cannot be resumed")]
    CannotResume,

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(uuid::Uuid),

    /// Operation needs a live subscription but this one is canceled
    #[error("subscription has ended")]
    SubscriptionEnded,

    /// A paid plan was requested without a payment instrument to charge
    #[error("a payment instrument is required for this plan")]
    InstrumentRequired,

    /// The gateway declined the charge; the surrounding operation was
    /// rolled back and nothing persists.
    #[error("payment declined: {0}")]
    PaymentDeclined(DeclineReason),

    /// Transient store failure, safe to retry
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BillingError {
    /// Whether the caller should retry (scheduler semantics: transient store
    /// failures retry immediately, declines and input errors do not).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Store(_))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decline_reason_display() {
        assert_eq!(
            DeclineReason::UnregisteredInstrument.to_string(),
            "unregistered_instrument"
        );
        assert_eq!(DeclineReason::CardDeclined.to_string(), "card_declined");
        assert_eq!(
            DeclineReason::InsufficientFunds.to_string(),
            "insufficient_funds"
        );
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(BillingError::Store(StoreError::Unavailable("db".into())).is_retryable());
        assert!(!BillingError::PlanNotFound("gold".into()).is_retryable());
        assert!(!BillingError::PaymentDeclined(DeclineReason::CardDeclined).is_retryable());
        assert!(!BillingError::CannotResume.is_retryable());
    }
}
