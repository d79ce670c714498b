//! SIP counters and gauges
//!
//! Recording is a no-op until a recorder is installed (see
//! `interface::api::init_metrics`).

use metrics::{counter, gauge};

/// Record an inbound request
pub fn record_request(method: &str, transport: &str) {
    counter!(
        "sip_requests_total",
        "method" => method.to_string(),
        "transport" => transport.to_string()
    )
    .increment(1);
}

/// Record a response sent upstream
pub fn record_response(status: u16) {
    counter!("sip_responses_total", "status" => status.to_string()).increment(1);
}

pub fn record_retransmission(method: &str) {
    counter!("sip_retransmissions_total", "method" => method.to_string()).increment(1);
}

/// Record a message dropped because it could not be parsed or framed
pub fn record_malformed(transport: &str) {
    counter!("sip_malformed_messages_total", "transport" => transport.to_string()).increment(1);
}

/// Record a REGISTER outcome
pub fn record_registration(outcome: &str) {
    counter!("sip_registrations_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_transaction_shed() {
    counter!("sip_transactions_shed_total").increment(1);
}

pub fn record_access_denied(reason: &str) {
    counter!("sip_access_denied_total", "reason" => reason.to_string()).increment(1);
}

pub fn update_active_transactions(count: usize) {
    gauge!("sip_active_transactions").set(count as f64);
}

pub fn update_location_bindings(count: usize) {
    gauge!("sip_location_bindings").set(count as f64);
}
