//! Location binding entity

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Association between an address-of-record and one reachable contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Canonical address-of-record (`sip:alice@example.com`)
    pub aor: String,
    /// Contact URI as sent by the user agent
    pub contact: String,
    pub expires_at: DateTime<Utc>,
    /// Call-ID of the REGISTER that created or last refreshed this binding
    pub call_id: String,
    pub cseq: u32,
    pub updated_at: DateTime<Utc>,
    /// Source address the REGISTER arrived from
    pub received: Option<SocketAddr>,
    /// Transport the REGISTER arrived on (`udp`, `tcp`, `tls`)
    pub transport: Option<String>,
    pub user_agent: Option<String>,
}

impl Binding {
    pub fn new(
        aor: impl Into<String>,
        contact: impl Into<String>,
        expires: u32,
        call_id: impl Into<String>,
        cseq: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            aor: aor.into(),
            contact: contact.into(),
            expires_at: now + Duration::seconds(expires as i64),
            call_id: call_id.into(),
            cseq,
            updated_at: now,
            received: None,
            transport: None,
            user_agent: None,
        }
    }

    pub fn with_source(mut self, received: SocketAddr, transport: &str) -> Self {
        self.received = Some(received);
        self.transport = Some(transport.to_ascii_lowercase());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Seconds left before expiry, zero once expired
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u32 {
        (self.expires_at - now).num_seconds().max(0) as u32
    }

    /// Whether a REGISTER carrying `call_id`/`cseq` is a replay of one already applied
    pub fn is_stale_update(&self, call_id: &str, cseq: u32) -> bool {
        self.call_id == call_id && cseq <= self.cseq
    }
}
