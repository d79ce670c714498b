//! Subscriber repository interface

use super::entity::Subscriber;
use crate::domain::shared::Result;
use async_trait::async_trait;

/// Read-only access to the subscriber table
#[async_trait]
pub trait SubscriberRepository: Send + Sync {
    /// Find subscriber by username and domain
    async fn find_by_username_and_domain(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Subscriber>>;
}
