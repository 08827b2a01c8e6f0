//! Plan catalog
//!
//! Plan definitions are read-only reference data: every other component reads
//! them, nothing in the core mutates them. Prices may change for new
//! subscribers only, so a catalog handed to the billing core is treated as
//! immutable and shared without locking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use pawsly_shared::BillingInterval;

use crate::error::StoreError;

/// Sentinel for "no quota" in [`Plan::limits`]
pub const UNLIMITED: i64 = -1;

/// Subscription plan definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique key; foreign key on subscriptions
    pub slug: String,
    pub monthly_price: Decimal,
    pub annual_price: Decimal,
    /// Days of free trial granted on subscribe; 0 = none
    pub trial_days: u32,
    /// Named features enabled on this plan
    pub feature_set: BTreeSet<String>,
    /// Named quota -> value; [`UNLIMITED`] means no cap
    pub limits: HashMap<String, i64>,
}

impl Plan {
    /// Price for one period of the given billing cycle
    pub fn price(&self, interval: BillingInterval) -> Decimal {
        match interval {
            BillingInterval::Monthly => self.monthly_price,
            BillingInterval::Annual => self.annual_price,
        }
    }

    pub fn is_free(&self) -> bool {
        self.monthly_price.is_zero() && self.annual_price.is_zero()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.feature_set.contains(feature)
    }

    /// Quota for a named limit; `None` if the plan does not define it
    pub fn limit(&self, name: &str) -> Option<i64> {
        self.limits.get(name).copied()
    }

    pub fn is_unlimited(&self, name: &str) -> bool {
        self.limit(name) == Some(UNLIMITED)
    }

    /// Free plan: 1 pet, 3 appointments/month, no trial
    pub fn free() -> Self {
        Self {
            slug: "free".to_string(),
            monthly_price: Decimal::ZERO,
            annual_price: Decimal::ZERO,
            trial_days: 0,
            feature_set: ["appointments"].iter().map(|s| s.to_string()).collect(),
            limits: HashMap::from([
                ("pets".to_string(), 1),
                ("appointments_per_month".to_string(), 3),
            ]),
        }
    }

    /// Basic plan: 5 pets, reminders, 14-day trial
    pub fn basic() -> Self {
        Self {
            slug: "basic".to_string(),
            monthly_price: Decimal::from(300),
            annual_price: Decimal::from(3000),
            trial_days: 14,
            feature_set: ["appointments", "reminders"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            limits: HashMap::from([
                ("pets".to_string(), 5),
                ("appointments_per_month".to_string(), 30),
            ]),
        }
    }

    /// Premium plan: unlimited pets, medical records, no trial
    pub fn premium() -> Self {
        Self {
            slug: "premium".to_string(),
            monthly_price: Decimal::from(500),
            annual_price: Decimal::from(5000),
            trial_days: 0,
            feature_set: ["appointments", "reminders", "medical_records"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            limits: HashMap::from([
                ("pets".to_string(), UNLIMITED),
                ("appointments_per_month".to_string(), 100),
            ]),
        }
    }

    /// Practice plan: multi-vet clinics, everything unlimited
    pub fn practice() -> Self {
        Self {
            slug: "practice".to_string(),
            monthly_price: Decimal::from(800),
            annual_price: Decimal::from(8000),
            trial_days: 0,
            feature_set: [
                "appointments",
                "reminders",
                "medical_records",
                "multi_vet",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            limits: HashMap::from([
                ("pets".to_string(), UNLIMITED),
                ("appointments_per_month".to_string(), UNLIMITED),
            ]),
        }
    }
}

/// Read-only plan lookup boundary
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, slug: &str) -> Result<Option<Plan>, StoreError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    /// Lookup with the free-plan fallback used on read paths: a dangling
    /// `plan_slug` on an existing subscription prices as free rather than
    /// failing the whole report.
    async fn get_or_free(&self, slug: &str) -> Result<Plan, StoreError> {
        Ok(self.get_plan(slug).await?.unwrap_or_else(Plan::free))
    }
}

/// Catalog backed by a fixed in-memory map
pub struct InMemoryPlanCatalog {
    plans: HashMap<String, Plan>,
}

impl InMemoryPlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self {
            plans: plans.into_iter().map(|p| (p.slug.clone(), p)).collect(),
        })
    }

    /// Catalog with the stock free/basic/premium/practice plans
    pub fn stock() -> Arc<Self> {
        Self::new(vec![
            Plan::free(),
            Plan::basic(),
            Plan::premium(),
            Plan::practice(),
        ])
    }
}

#[async_trait]
impl PlanCatalog for InMemoryPlanCatalog {
    async fn get_plan(&self, slug: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self.plans.get(slug).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        Ok(self.plans.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stock_catalog_lookup() {
        let catalog = InMemoryPlanCatalog::stock();
        let plan = catalog.get_plan("premium").await.unwrap().unwrap();
        assert_eq!(plan.monthly_price, Decimal::from(500));
        assert_eq!(plan.trial_days, 0);
        assert!(catalog.get_plan("platinum").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_slug_falls_back_to_free() {
        let catalog = InMemoryPlanCatalog::stock();
        let plan = catalog.get_or_free("deleted-legacy-plan").await.unwrap();
        assert_eq!(plan.slug, "free");
        assert!(plan.is_free());
    }

    #[test]
    fn test_limits() {
        let premium = Plan::premium();
        assert!(premium.is_unlimited("pets"));
        assert_eq!(premium.limit("appointments_per_month"), Some(100));
        assert_eq!(premium.limit("unknown_quota"), None);

        let basic = Plan::basic();
        assert!(!basic.is_unlimited("pets"));
        assert_eq!(basic.limit("pets"), Some(5));
    }

    #[test]
    fn test_price_by_interval() {
        let basic = Plan::basic();
        assert_eq!(basic.price(BillingInterval::Monthly), Decimal::from(300));
        assert_eq!(basic.price(BillingInterval::Annual), Decimal::from(3000));
        assert!(!basic.is_free());
        assert!(Plan::free().is_free());
    }
}
