//! API Router configuration

use super::location_handler::{get_location, health_check, AppState};
use super::metrics_handler::metrics_handler;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

/// Build the admin API router
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    let location_routes = Router::new()
        .route("/health", get(health_check))
        .route("/locations/:aor", get(get_location))
        .with_state(state);

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(location_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}
