//! PostgreSQL implementation of SubscriberRepository

use crate::domain::shared::{DomainError, Result};
use crate::domain::subscriber::{Subscriber, SubscriberRepository};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::error;

pub struct PgSubscriberRepository {
    pool: PgPool,
}

impl PgSubscriberRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberRepository for PgSubscriberRepository {
    async fn find_by_username_and_domain(
        &self,
        username: &str,
        domain: &str,
    ) -> Result<Option<Subscriber>> {
        sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT username, domain, password, ha1, enabled
            FROM subscriber
            WHERE username = $1 AND lower(domain) = lower($2)
            "#,
        )
        .bind(username)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load subscriber {}@{}: {}", username, domain, e);
            DomainError::StorageUnavailable(e.to_string())
        })
    }
}
