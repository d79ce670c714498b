//! Location service - binding registration and resolution
//!
//! All mutations for one address-of-record go through a per-AoR async mutex,
//! so concurrent REGISTERs for the same user are applied in arrival order
//! while different users never wait on each other. The repository is only
//! touched while that per-AoR guard is held; the repository's own lock (if it
//! has one) is scoped to a single call.

use super::binding::Binding;
use super::repository::LocationRepository;
use crate::domain::shared::Result;
use chrono::Utc;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A single contact update extracted from a REGISTER
#[derive(Debug, Clone)]
pub struct BindingUpdate {
    pub aor: String,
    pub contact: String,
    /// Effective expiry in seconds, zero withdraws the binding
    pub expires: u32,
    pub call_id: String,
    pub cseq: u32,
    pub received: Option<SocketAddr>,
    pub transport: Option<String>,
    pub user_agent: Option<String>,
}

impl BindingUpdate {
    pub fn new(
        aor: impl Into<String>,
        contact: impl Into<String>,
        expires: u32,
        call_id: impl Into<String>,
        cseq: u32,
    ) -> Self {
        Self {
            aor: aor.into(),
            contact: contact.into(),
            expires,
            call_id: call_id.into(),
            cseq,
            received: None,
            transport: None,
            user_agent: None,
        }
    }

    pub fn with_source(mut self, received: SocketAddr, transport: &str) -> Self {
        self.received = Some(received);
        self.transport = Some(transport.to_string());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Result of applying one binding update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Refreshed,
    Removed,
    /// Removal of a binding that does not exist; acknowledged all the same
    NotFound,
    /// Replayed REGISTER (same Call-ID, CSeq not greater); nothing changed
    Stale,
}

/// Registrar and resolver over a [`LocationRepository`]
pub struct LocationService {
    repository: Arc<dyn LocationRepository>,
    aor_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocationService {
    pub fn new(repository: Arc<dyn LocationRepository>) -> Self {
        Self {
            repository,
            aor_locks: DashMap::new(),
        }
    }

    fn aor_lock(&self, aor: &str) -> Arc<Mutex<()>> {
        self.aor_locks
            .entry(aor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert, refresh or withdraw the binding (aor, contact)
    pub async fn register(
        &self,
        aor: &str,
        contact: &str,
        expires: u32,
        call_id: &str,
        cseq: u32,
    ) -> Result<RegisterOutcome> {
        self.apply(BindingUpdate::new(aor, contact, expires, call_id, cseq))
            .await
    }

    /// Apply a binding update under the address-of-record's lock
    pub async fn apply(&self, update: BindingUpdate) -> Result<RegisterOutcome> {
        let lock = self.aor_lock(&update.aor);
        let _guard = lock.lock().await;
        self.apply_locked(update).await
    }

    /// Apply several updates for the same address-of-record atomically
    /// with respect to other REGISTERs for it
    pub async fn apply_all(
        &self,
        aor: &str,
        updates: Vec<BindingUpdate>,
    ) -> Result<Vec<RegisterOutcome>> {
        let lock = self.aor_lock(aor);
        let _guard = lock.lock().await;

        let mut outcomes = Vec::with_capacity(updates.len());
        for update in updates {
            outcomes.push(self.apply_locked(update).await?);
        }
        Ok(outcomes)
    }

    async fn apply_locked(&self, update: BindingUpdate) -> Result<RegisterOutcome> {
        let now = Utc::now();
        let existing = self
            .repository
            .find(&update.aor)
            .await?
            .into_iter()
            .find(|b| b.contact == update.contact && !b.is_expired_at(now));

        if let Some(current) = &existing {
            if current.is_stale_update(&update.call_id, update.cseq) {
                debug!(
                    "Ignoring stale REGISTER for {} -> {} (call-id {}, cseq {} <= {})",
                    update.aor, update.contact, update.call_id, update.cseq, current.cseq
                );
                return Ok(RegisterOutcome::Stale);
            }
        }

        if update.expires == 0 {
            return match existing {
                Some(_) => {
                    self.repository.delete(&update.aor, &update.contact).await?;
                    info!("Unregistered: {} -> {}", update.aor, update.contact);
                    Ok(RegisterOutcome::Removed)
                }
                None => Ok(RegisterOutcome::NotFound),
            };
        }

        let mut binding = Binding::new(
            &update.aor,
            &update.contact,
            update.expires,
            &update.call_id,
            update.cseq,
        )
        .with_user_agent(update.user_agent);
        if let (Some(received), Some(transport)) = (update.received, update.transport.as_deref()) {
            binding = binding.with_source(received, transport);
        }

        let outcome = match existing {
            Some(current) => {
                // Expiry never moves backwards within one registration
                if current.call_id == update.call_id && current.expires_at > binding.expires_at {
                    binding.expires_at = current.expires_at;
                }
                RegisterOutcome::Refreshed
            }
            None => RegisterOutcome::Created,
        };

        self.repository.upsert(&binding).await?;
        info!(
            "Registered: {} -> {} (expires in {}s, {:?})",
            update.aor, update.contact, update.expires, outcome
        );
        Ok(outcome)
    }

    /// `Contact: *` with `Expires: 0`: withdraw every binding of the AoR
    /// that this REGISTER is not a replay for
    pub async fn remove_all(&self, aor: &str, call_id: &str, cseq: u32) -> Result<usize> {
        let lock = self.aor_lock(aor);
        let _guard = lock.lock().await;

        let bindings = self.repository.find(aor).await?;
        if bindings.iter().all(|b| !b.is_stale_update(call_id, cseq)) {
            let removed = self.repository.delete_all(aor).await?;
            info!("Unregistered all {} bindings of {}", removed, aor);
            return Ok(removed);
        }

        let mut removed = 0;
        for binding in bindings.iter().filter(|b| !b.is_stale_update(call_id, cseq)) {
            if self.repository.delete(aor, &binding.contact).await? {
                removed += 1;
            }
        }
        info!("Unregistered {} bindings of {}", removed, aor);
        Ok(removed)
    }

    /// Live bindings for an AoR, most recently refreshed first.
    /// Expired bindings are filtered here even if the reaper has not run.
    pub async fn resolve(&self, aor: &str) -> Result<Vec<Binding>> {
        let now = Utc::now();
        let mut live: Vec<Binding> = self
            .repository
            .find(aor)
            .await?
            .into_iter()
            .filter(|b| !b.is_expired_at(now))
            .collect();
        live.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(live)
    }

    /// Remove expired bindings and forget idle per-AoR locks
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.repository.purge_expired(Utc::now()).await?;
        // Only the map holds an idle lock
        self.aor_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if removed > 0 {
            info!("Reaper removed {} expired bindings", removed);
        }
        Ok(removed)
    }

    pub async fn binding_count(&self) -> Result<usize> {
        self.repository.count().await
    }

    /// Number of per-AoR locks currently tracked
    pub fn tracked_aor_count(&self) -> usize {
        self.aor_locks.len()
    }

    /// Run [`purge_expired`](Self::purge_expired) periodically
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Location reaper started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.purge_expired().await {
                    warn!("Location reaper failed: {}", e);
                }
            }
        })
    }
}
