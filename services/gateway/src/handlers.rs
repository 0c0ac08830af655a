//! Axum Handlers for the REST API
//!
//! Liveness and readiness probes for the gateway. They use `utoipa` doc
//! comments to generate OpenAPI documentation.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::{
    models::{ErrorResponse, HealthResponse, ReadyResponse},
    state::AppState,
};

/// Errors surfaced to HTTP clients.
pub enum ApiError {
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::ServiceUnavailable(message) => {
                warn!(%message, "Refusing request");
                (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

/// Report service liveness and call counters.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "voice-gateway".to_string(),
        timestamp: Utc::now(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        calls: state.registry.counts(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Report whether the gateway accepts new calls.
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Accepting calls", body = ReadyResponse),
        (status = 503, description = "Not accepting calls", body = ReadyResponse)
    )
)]
pub async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadyResponse>) {
    if !state.registry.is_accepting() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some("gateway is shutting down".to_string()),
            }),
        );
    }
    (
        StatusCode::OK,
        Json(ReadyResponse {
            ready: true,
            message: None,
        }),
    )
}
