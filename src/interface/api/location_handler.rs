//! Health and location lookup endpoints

use super::dto::{ApiResponse, BindingResponse, HealthResponse, LocationResponse};
use crate::domain::location::LocationService;
use crate::domain::shared::value_objects::normalize_aor;
use crate::domain::DomainError;
use crate::infrastructure::protocols::sip::TransactionLayer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Shared state of the admin API
#[derive(Clone)]
pub struct AppState {
    pub location: Arc<LocationService>,
    pub transactions: Arc<TransactionLayer>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(location: Arc<LocationService>, transactions: Arc<TransactionLayer>) -> Self {
        Self {
            location,
            transactions,
            started_at: Instant::now(),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let location_bindings = match state.location.binding_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            error!("Health check could not reach the location store: {}", e);
            None
        }
    };
    let status = if location_bindings.is_some() {
        "OK"
    } else {
        "DEGRADED"
    };

    Json(ApiResponse::success(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_transactions: state.transactions.transaction_count().await,
        location_bindings,
    }))
}

/// Live bindings of an address-of-record (`sip:` may be omitted)
pub async fn get_location(
    State(state): State<AppState>,
    Path(aor): Path<String>,
) -> ApiResult<LocationResponse> {
    debug!("API: Looking up location of {}", aor);

    let uri = if aor.contains(':') {
        aor
    } else {
        format!("sip:{}", aor)
    };
    let aor = normalize_aor(&uri).map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;

    let bindings = state
        .location
        .resolve(&aor)
        .await
        .map_err(|e| failure(StatusCode::SERVICE_UNAVAILABLE, e))?;
    if bindings.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("{} is not registered", aor))),
        ));
    }

    let now = Utc::now();
    Ok(Json(ApiResponse::success(LocationResponse {
        bindings: bindings
            .iter()
            .map(|b| BindingResponse::from_binding(b, now))
            .collect(),
        aor,
    })))
}

fn failure<T>(status: StatusCode, err: DomainError) -> (StatusCode, Json<ApiResponse<T>>) {
    (status, Json(ApiResponse::error(err.to_string())))
}
