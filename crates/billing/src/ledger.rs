//! Billing record ledger
//!
//! Append-only record of every completed or failed billing attempt. The
//! uniqueness of `(subscription_id, billing_date)` is the idempotency key for
//! the recurring generator and the primary guard against double-charging.
//!
//! A real deployment backs this with a unique index and a transaction; the
//! in-memory implementation exposes the same guarantee as a three-step
//! claim / commit / release protocol:
//!
//! 1. `claim` atomically takes the key (the unique-index insert). A second
//!    claimant sees `false` and backs off without charging.
//! 2. the caller moves money through the payment ledger,
//! 3. `commit` attaches the final record, or `release` abandons the claim on
//!    a transient failure so a retry can start clean.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;

/// Outcome recorded for one billing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRecordStatus {
    Paid,
    Failed,
}

impl BillingRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRecordStatus::Paid => "paid",
            BillingRecordStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BillingRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable ledger entry. Never mutated after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub subscription_id: Uuid,
    pub amount: Decimal,
    /// Idempotency key together with `subscription_id`
    pub billing_date: NaiveDate,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: BillingRecordStatus,
    /// Instrument the charge was attempted against, when one was selected
    pub payment_instrument_id: Option<Uuid>,
    pub transaction_id: Uuid,
}

/// Append-only billing ledger boundary
#[async_trait]
pub trait BillingLedger: Send + Sync {
    /// Atomically claim `(subscription_id, billing_date)`. Returns `false`
    /// when a record or live claim already holds the key.
    async fn claim(&self, subscription_id: Uuid, date: NaiveDate) -> Result<bool, StoreError>;

    /// Attach the final record to a previously claimed key.
    async fn commit(&self, record: BillingRecord) -> Result<(), StoreError>;

    /// Abandon a claim after a transient failure; the key becomes claimable
    /// again.
    async fn release(&self, subscription_id: Uuid, date: NaiveDate) -> Result<(), StoreError>;

    async fn get(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<BillingRecord>, StoreError>;

    async fn records_for(&self, subscription_id: Uuid) -> Result<Vec<BillingRecord>, StoreError>;

    async fn list_by_status(
        &self,
        status: BillingRecordStatus,
    ) -> Result<Vec<BillingRecord>, StoreError>;

    async fn list_in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BillingRecord>, StoreError>;
}

/// In-memory ledger. A single mutex over the slot map makes claim/commit
/// linearizable, giving the same no-double-charge guarantee a database
/// unique index would.
#[derive(Default)]
pub struct InMemoryBillingLedger {
    // None = claimed but not yet committed
    slots: Mutex<HashMap<(Uuid, NaiveDate), Option<BillingRecord>>>,
}

impl InMemoryBillingLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BillingLedger for InMemoryBillingLedger {
    async fn claim(&self, subscription_id: Uuid, date: NaiveDate) -> Result<bool, StoreError> {
        let mut slots = self.slots.lock().await;
        match slots.entry((subscription_id, date)) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(None);
                Ok(true)
            }
        }
    }

    async fn commit(&self, record: BillingRecord) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().await;
        let key = (record.subscription_id, record.billing_date);
        match slots.get(&key) {
            Some(None) => {
                slots.insert(key, Some(record));
                Ok(())
            }
            Some(Some(_)) => Err(StoreError::Unavailable(format!(
                "billing record for subscription {} on {} already committed",
                key.0, key.1
            ))),
            None => Err(StoreError::Unavailable(format!(
                "commit without claim for subscription {} on {}",
                key.0, key.1
            ))),
        }
    }

    async fn release(&self, subscription_id: Uuid, date: NaiveDate) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().await;
        // Only live claims are releasable; committed records are immutable.
        if let Some(None) = slots.get(&(subscription_id, date)) {
            slots.remove(&(subscription_id, date));
        }
        Ok(())
    }

    async fn get(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<BillingRecord>, StoreError> {
        Ok(self
            .slots
            .lock()
            .await
            .get(&(subscription_id, date))
            .and_then(|slot| slot.clone()))
    }

    async fn records_for(&self, subscription_id: Uuid) -> Result<Vec<BillingRecord>, StoreError> {
        let slots = self.slots.lock().await;
        let mut records: Vec<BillingRecord> = slots
            .values()
            .flatten()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.billing_date);
        Ok(records)
    }

    async fn list_by_status(
        &self,
        status: BillingRecordStatus,
    ) -> Result<Vec<BillingRecord>, StoreError> {
        let slots = self.slots.lock().await;
        Ok(slots
            .values()
            .flatten()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn list_in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BillingRecord>, StoreError> {
        let slots = self.slots.lock().await;
        Ok(slots
            .values()
            .flatten()
            .filter(|r| r.billing_date >= from && r.billing_date < to)
            .cloned()
            .collect())
    }
}
