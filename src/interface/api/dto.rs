//! API data transfer objects

use crate::domain::location::Binding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope of every JSON answer
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_transactions: usize,
    /// `None` when the location store could not be reached
    pub location_bindings: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BindingResponse {
    pub contact: String,
    pub expires_in: u32,
    pub expires_at: DateTime<Utc>,
    pub call_id: String,
    pub cseq: u32,
    pub received: Option<String>,
    pub transport: Option<String>,
    pub user_agent: Option<String>,
}

impl BindingResponse {
    pub fn from_binding(binding: &Binding, now: DateTime<Utc>) -> Self {
        Self {
            contact: binding.contact.clone(),
            expires_in: binding.remaining_secs(now),
            expires_at: binding.expires_at,
            call_id: binding.call_id.clone(),
            cseq: binding.cseq,
            received: binding.received.map(|addr| addr.to_string()),
            transport: binding.transport.clone(),
            user_agent: binding.user_agent.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationResponse {
    pub aor: String,
    pub bindings: Vec<BindingResponse>,
}
