//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the probes, the carrier WebSocket endpoint, and OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{CallCounts, ErrorResponse, HealthResponse, ReadyResponse},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::health, handlers::ready),
    components(schemas(HealthResponse, ReadyResponse, CallCounts, ErrorResponse)),
    tags(
        (name = "Voice Gateway", description = "Carrier to AI realtime call bridge")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/ws/twilio", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = test_state();
        let _call = state.registry.register().unwrap();

        let (status, body) = get_json(create_router(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "voice-gateway");
        assert_eq!(body["calls"]["total"], 1);
        assert_eq!(body["calls"]["active"], 1);
        assert!(body["timestamp"].is_string());
        assert!(body["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_ready_flips_on_shutdown() {
        let state = test_state();

        let (status, body) = get_json(create_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);

        state.registry.shutdown();
        let (status, body) = get_json(create_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_media_stream_refused_while_shutting_down() {
        let state = test_state();
        state.registry.shutdown();

        let (status, body) = get_json(create_router(state.clone()), "/ws/twilio").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["message"].as_str().unwrap().contains("shutting down"));
        assert_eq!(state.registry.counts().total, 0);
    }

    #[tokio::test]
    async fn test_media_stream_requires_upgrade() {
        let state = test_state();
        let response = create_router(state.clone())
            .oneshot(Request::builder().uri("/ws/twilio").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        // The rejected request released its registration.
        assert_eq!(state.registry.counts().active, 0);
    }

    #[tokio::test]
    async fn test_openapi_document_served() {
        let (status, body) = get_json(create_router(test_state()), "/api-docs/openapi.json").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/health"].is_object());
        assert!(body["paths"]["/ready"].is_object());
    }
}
