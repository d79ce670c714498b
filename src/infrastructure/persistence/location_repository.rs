//! PostgreSQL implementation of LocationRepository

use crate::domain::location::{Binding, LocationRepository};
use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error};

/// Bindings stored in the `location` table, unique on (aor, contact)
pub struct PgLocationRepository {
    pool: PgPool,
}

impl PgLocationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(context: &str, e: sqlx::Error) -> DomainError {
    error!("{}: {}", context, e);
    DomainError::StorageUnavailable(format!("{}: {}", context, e))
}

fn row_to_binding(row: PgRow) -> Binding {
    let received: Option<String> = row.get("received");
    Binding {
        aor: row.get("aor"),
        contact: row.get("contact"),
        expires_at: row.get("expires_at"),
        call_id: row.get("call_id"),
        cseq: row.get::<i64, _>("cseq") as u32,
        updated_at: row.get("updated_at"),
        received: received.and_then(|r| r.parse().ok()),
        transport: row.get("transport"),
        user_agent: row.get("user_agent"),
    }
}

#[async_trait]
impl LocationRepository for PgLocationRepository {
    async fn find(&self, aor: &str) -> Result<Vec<Binding>> {
        let rows = sqlx::query(
            r#"
            SELECT aor, contact, expires_at, call_id, cseq, updated_at,
                   received, transport, user_agent
            FROM location
            WHERE aor = $1
            "#,
        )
        .bind(aor)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load bindings", e))?;

        Ok(rows.into_iter().map(row_to_binding).collect())
    }

    async fn upsert(&self, binding: &Binding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO location
            (aor, contact, expires_at, call_id, cseq, updated_at, received, transport, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (aor, contact) DO UPDATE SET
                expires_at = EXCLUDED.expires_at,
                call_id = EXCLUDED.call_id,
                cseq = EXCLUDED.cseq,
                updated_at = EXCLUDED.updated_at,
                received = EXCLUDED.received,
                transport = EXCLUDED.transport,
                user_agent = EXCLUDED.user_agent
            "#,
        )
        .bind(&binding.aor)
        .bind(&binding.contact)
        .bind(binding.expires_at)
        .bind(&binding.call_id)
        .bind(binding.cseq as i64)
        .bind(binding.updated_at)
        .bind(binding.received.map(|r| r.to_string()))
        .bind(binding.transport.as_ref())
        .bind(binding.user_agent.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to store binding", e))?;

        debug!("Stored binding {} -> {}", binding.aor, binding.contact);
        Ok(())
    }

    async fn delete(&self, aor: &str, contact: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM location WHERE aor = $1 AND contact = $2")
            .bind(aor)
            .bind(contact)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to delete binding", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, aor: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM location WHERE aor = $1")
            .bind(aor)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to delete bindings", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM location WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to purge bindings", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM location")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to count bindings", e))?;
        Ok(row.get::<i64, _>("count") as usize)
    }
}
