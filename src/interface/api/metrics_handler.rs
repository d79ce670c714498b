//! Prometheus metrics handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe the SIP metrics
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("sip_requests_total", "SIP requests received");
    describe_counter!("sip_responses_total", "SIP responses sent upstream");
    describe_counter!(
        "sip_retransmissions_total",
        "Request retransmissions absorbed or answered from the transaction"
    );
    describe_counter!(
        "sip_malformed_messages_total",
        "Messages dropped or rejected as malformed"
    );
    describe_counter!("sip_registrations_total", "REGISTER outcomes");
    describe_counter!(
        "sip_transactions_shed_total",
        "Requests refused because the transaction table was full"
    );
    describe_counter!(
        "sip_access_denied_total",
        "Requests refused by the access guard"
    );
    describe_gauge!("sip_active_transactions", "Server transactions alive");
    describe_gauge!("sip_location_bindings", "Stored location bindings");
}

/// HTTP metrics handler
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
