//! Location repository interface

use super::binding::Binding;
use crate::domain::shared::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage port for location bindings
///
/// Implementations hold their own locks only for the duration of a single
/// call; ordering between calls for one address-of-record is the caller's job.
#[async_trait]
pub trait LocationRepository: Send + Sync {
    /// All bindings stored for an address-of-record, expired ones included
    async fn find(&self, aor: &str) -> Result<Vec<Binding>>;

    /// Insert or replace the binding keyed by (aor, contact)
    async fn upsert(&self, binding: &Binding) -> Result<()>;

    /// Delete one binding, returns whether it existed
    async fn delete(&self, aor: &str, contact: &str) -> Result<bool>;

    /// Delete every binding of an address-of-record
    async fn delete_all(&self, aor: &str) -> Result<usize>;

    /// Remove bindings that expired before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Number of stored bindings
    async fn count(&self) -> Result<usize>;
}
