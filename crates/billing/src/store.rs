//! Subscription store boundary
//!
//! The surrounding application owns real persistence; the core only needs
//! this narrow contract. The in-memory implementation backs the simulation
//! harness and the test suite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::subscriptions::Subscription;

/// Create/read/update boundary for subscriptions.
///
/// "At most one non-canceled subscription per owner" is enforced by the
/// lifecycle manager, not by the store; the store only has to answer the
/// owner lookup it needs for that check.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: Subscription) -> Result<(), StoreError>;

    async fn update(&self, subscription: Subscription) -> Result<(), StoreError>;

    /// Removes a subscription outright. Only used to roll back a `subscribe`
    /// whose initial charge was declined.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;

    async fn find_non_canceled_by_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;
}

/// In-memory subscription store
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription);
        Ok(())
    }

    async fn update(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.write().await;
        if !subs.contains_key(&subscription.id) {
            return Err(StoreError::Unavailable(format!(
                "subscription {} does not exist",
                subscription.id
            )));
        }
        subs.insert(subscription.id, subscription);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.subscriptions.write().await.remove(&id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn find_non_canceled_by_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .find(|s| s.owner_id == owner_id && s.status.is_non_canceled())
            .cloned())
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.values().cloned().collect())
    }
}
