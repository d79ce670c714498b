//! In-memory repositories, used when no database is configured

use crate::domain::location::{Binding, LocationRepository};
use crate::domain::shared::Result;
use crate::domain::subscriber::{Subscriber, SubscriberRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Location store keyed by address-of-record
#[derive(Default)]
pub struct InMemoryLocationRepository {
    bindings: RwLock<HashMap<String, Vec<Binding>>>,
}

impl InMemoryLocationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationRepository for InMemoryLocationRepository {
    async fn find(&self, aor: &str) -> Result<Vec<Binding>> {
        Ok(self
            .bindings
            .read()
            .await
            .get(aor)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(&self, binding: &Binding) -> Result<()> {
        let mut bindings = self.bindings.write().await;
        let entries = bindings.entry(binding.aor.clone()).or_default();
        match entries.iter_mut().find(|b| b.contact == binding.contact) {
            Some(existing) => *existing = binding.clone(),
            None => entries.push(binding.clone()),
        }
        Ok(())
    }

    async fn delete(&self, aor: &str, contact: &str) -> Result<bool> {
        let mut bindings = self.bindings.write().await;
        let Some(entries) = bindings.get_mut(aor) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|b| b.contact != contact);
        let removed = entries.len() != before;
        if entries.is_empty() {
            bindings.remove(aor);
        }
        Ok(removed)
    }

    async fn delete_all(&self, aor: &str) -> Result<usize> {
        Ok(self
            .bindings
            .write()
            .await
            .remove(aor)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut bindings = self.bindings.write().await;
        let mut removed = 0;
        bindings.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|b| !b.is_expired_at(now));
            removed += before - entries.len();
            !entries.is_empty()
        });
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.bindings.read().await.values().map(Vec::len).sum())
    }
}

/// Subscriber table held in memory
#[derive(Default)]
pub struct InMemorySubscriberRepository {
    subscribers: RwLock<HashMap<(String, String), Subscriber>>,
}

impl InMemorySubscriberRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, subscriber: Subscriber) {
        let key = (
            subscriber.username.clone(),
            subscriber.domain.to_ascii_lowercase(),
        );
        self.subscribers.write().await.insert(key, subscriber);
    }
}

#[async_trait]
impl SubscriberRepository for InMemorySubscriberRepository {
    async fn find_by_username_and_domain(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Subscriber>> {
        let key = (username.to_string(), domain.to_ascii_lowercase());
        Ok(self.subscribers.read().await.get(&key).cloned())
    }
}
