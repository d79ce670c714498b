//! Source access control: allow/deny lists, flood guard and brute-force blocker
//!
//! The flood guard keeps one sliding window per source address. The table of
//! windows is bounded: idle windows are dropped by [`AccessGuard::cleanup_expired`]
//! and, when the table is full, the source seen least recently is evicted.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::collections::VecDeque;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Why a source was blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Listed in configuration
    Static,
    /// Request rate over the flood limit
    Flooding,
    /// Too many authentication failures
    BruteForce,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Static => write!(f, "Statically blocked"),
            BlockReason::Flooding => write!(f, "Too many requests"),
            BlockReason::BruteForce => write!(f, "Too many auth failures"),
        }
    }
}

/// Blocked source
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub ip_address: IpAddr,
    pub reason: BlockReason,
    pub added_at: DateTime<Utc>,
    /// `None` for permanent blocks
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockEntry {
    pub fn new(ip_address: IpAddr, reason: BlockReason) -> Self {
        Self {
            ip_address,
            reason,
            added_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, duration: Duration) -> Self {
        self.expires_at = Some(self.added_at + duration);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }
}

/// Reason a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    /// Source outside every allowed network
    NotAllowed,
    Blocked,
    /// This request crossed the flood limit
    Flooding,
}

impl AccessDenied {
    /// Reason phrase for the 403 answer
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            AccessDenied::Flooding => "Forbidden - Too Many Requests",
            AccessDenied::NotAllowed | AccessDenied::Blocked => "Forbidden",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessDenied::NotAllowed => "not_allowed",
            AccessDenied::Blocked => "blocked",
            AccessDenied::Flooding => "flooding",
        }
    }
}

/// Sliding window of request timestamps for one source
#[derive(Debug, Clone)]
struct RequestTracker {
    timestamps: VecDeque<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

impl RequestTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamps: VecDeque::new(),
            last_seen: now,
        }
    }

    fn cleanup_old_requests(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&timestamp) = self.timestamps.front() {
            if timestamp < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Authentication failure tracking
#[derive(Debug, Clone, Default)]
struct FailureTracker {
    failures: VecDeque<DateTime<Utc>>,
}

impl FailureTracker {
    fn cleanup_old_failures(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&timestamp) = self.failures.front() {
            if timestamp < cutoff {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Flood guard ("pike") settings
#[derive(Debug, Clone)]
pub struct FloodConfig {
    pub enabled: bool,
    /// Window length in seconds
    pub sampling_secs: i64,
    /// Requests accepted per window
    pub max_requests: usize,
    pub block_secs: i64,
    /// Upper bound on the number of tracked sources
    pub max_tracked: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_secs: 2,
            max_requests: 5,
            block_secs: 3600,
            max_tracked: 10_000,
        }
    }
}

/// Configuration for the access guard
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// When non-empty only these networks may send requests
    pub allowed_networks: Vec<IpNetwork>,
    /// Permanently blocked sources
    pub blocked_ips: Vec<IpAddr>,
    /// Exempt from flood and brute-force limits
    pub trusted_networks: Vec<IpNetwork>,
    pub flood: FloodConfig,
    pub max_auth_failures: usize,
    pub auth_failure_window_secs: i64,
    pub auth_failure_block_secs: i64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_networks: Vec::new(),
            blocked_ips: Vec::new(),
            trusted_networks: Vec::new(),
            flood: FloodConfig::default(),
            max_auth_failures: 5,
            auth_failure_window_secs: 300,
            auth_failure_block_secs: 3600,
        }
    }
}

/// Per-source admission decisions
pub struct AccessGuard {
    config: AccessConfig,
    blocks: DashMap<IpAddr, BlockEntry>,
    request_trackers: DashMap<IpAddr, RequestTracker>,
    failure_trackers: DashMap<IpAddr, FailureTracker>,
}

impl AccessGuard {
    pub fn new(config: AccessConfig) -> Self {
        let blocks = DashMap::new();
        for ip in &config.blocked_ips {
            blocks.insert(*ip, BlockEntry::new(*ip, BlockReason::Static));
        }
        Self {
            config,
            blocks,
            request_trackers: DashMap::new(),
            failure_trackers: DashMap::new(),
        }
    }

    /// Whether the source lies in a trusted network
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.config.trusted_networks.iter().any(|net| net.contains(*ip))
    }

    /// Whether the source lies in an allowed network (always true with no list)
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.config.allowed_networks.is_empty()
            || self.config.allowed_networks.iter().any(|net| net.contains(*ip))
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.is_blocked_at(ip, Utc::now())
    }

    fn is_blocked_at(&self, ip: &IpAddr, now: DateTime<Utc>) -> bool {
        self.blocks
            .get(ip)
            .map(|entry| !entry.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Admit or refuse one request from `ip`, counting it against the flood window
    pub fn check(&self, ip: &IpAddr) -> Result<(), AccessDenied> {
        self.check_at(ip, Utc::now())
    }

    pub(crate) fn check_at(&self, ip: &IpAddr, now: DateTime<Utc>) -> Result<(), AccessDenied> {
        if !self.is_allowed(ip) {
            return Err(AccessDenied::NotAllowed);
        }
        if self.is_blocked_at(ip, now) {
            if let Some(entry) = self.blocks.get(ip) {
                debug!("Refusing {}: {}", ip, entry.reason);
            }
            return Err(AccessDenied::Blocked);
        }
        if !self.config.flood.enabled || self.is_trusted(ip) {
            return Ok(());
        }

        if !self.request_trackers.contains_key(ip)
            && self.request_trackers.len() >= self.config.flood.max_tracked
        {
            self.evict_oldest_tracker(now);
        }

        let flooding = {
            let mut tracker = self
                .request_trackers
                .entry(*ip)
                .or_insert_with(|| RequestTracker::new(now));
            tracker.cleanup_old_requests(now - Duration::seconds(self.config.flood.sampling_secs));
            tracker.last_seen = now;
            if tracker.timestamps.len() >= self.config.flood.max_requests {
                tracker.timestamps.clear();
                true
            } else {
                tracker.timestamps.push_back(now);
                false
            }
        };

        if flooding {
            warn!(
                "Flood limit exceeded by {} ({} requests in {}s), blocking for {}s",
                ip,
                self.config.flood.max_requests,
                self.config.flood.sampling_secs,
                self.config.flood.block_secs
            );
            self.block_ip(
                BlockEntry::new(*ip, BlockReason::Flooding)
                    .with_expiry(Duration::seconds(self.config.flood.block_secs)),
            );
            return Err(AccessDenied::Flooding);
        }

        Ok(())
    }

    fn evict_oldest_tracker(&self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.config.flood.sampling_secs);
        self.request_trackers.retain(|_, t| t.last_seen >= cutoff);

        if self.request_trackers.len() < self.config.flood.max_tracked {
            return;
        }
        let oldest = self
            .request_trackers
            .iter()
            .min_by_key(|entry| entry.value().last_seen)
            .map(|entry| *entry.key());
        if let Some(ip) = oldest {
            debug!("Flood table full, evicting {}", ip);
            self.request_trackers.remove(&ip);
        }
    }

    /// Add a block entry, replacing any existing one for the same source
    fn block_ip(&self, entry: BlockEntry) {
        self.blocks.insert(entry.ip_address, entry);
    }

    /// Record an authentication failure; returns true when it caused a block
    pub fn record_auth_failure(&self, ip: &IpAddr) -> bool {
        self.record_auth_failure_at(ip, Utc::now())
    }

    fn record_auth_failure_at(&self, ip: &IpAddr, now: DateTime<Utc>) -> bool {
        if self.is_trusted(ip) || self.config.max_auth_failures == 0 {
            return false;
        }

        let exceeded = {
            let mut tracker = self.failure_trackers.entry(*ip).or_default();
            tracker.cleanup_old_failures(now - Duration::seconds(self.config.auth_failure_window_secs));
            tracker.failures.push_back(now);
            tracker.failures.len() >= self.config.max_auth_failures
        };

        if exceeded {
            self.failure_trackers.remove(ip);
            warn!(
                "Blocking {} after {} authentication failures",
                ip, self.config.max_auth_failures
            );
            self.block_ip(
                BlockEntry::new(*ip, BlockReason::BruteForce)
                    .with_expiry(Duration::seconds(self.config.auth_failure_block_secs)),
            );
        }
        exceeded
    }

    /// Record successful authentication (reset failure counter)
    pub fn record_auth_success(&self, ip: &IpAddr) {
        self.failure_trackers.remove(ip);
    }

    /// Drop expired blocks and idle windows; returns the number of entries removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.blocks.len() + self.request_trackers.len() + self.failure_trackers.len();

        self.blocks.retain(|_, entry| !entry.is_expired_at(now));

        let request_cutoff = now - Duration::seconds(self.config.flood.sampling_secs);
        self.request_trackers
            .retain(|_, tracker| tracker.last_seen >= request_cutoff);

        let failure_cutoff = now - Duration::seconds(self.config.auth_failure_window_secs);
        self.failure_trackers.retain(|_, tracker| {
            tracker.cleanup_old_failures(failure_cutoff);
            !tracker.failures.is_empty()
        });

        let after = self.blocks.len() + self.request_trackers.len() + self.failure_trackers.len();
        let removed = before.saturating_sub(after);
        if removed > 0 {
            info!("Access guard cleanup removed {} entries", removed);
        }
        removed
    }
}
