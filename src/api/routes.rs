//! HTTP API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health, ready, reset_kill_switch, status, AppState};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Status and operator endpoints
        .route("/api/v1/status", get(status))
        .route("/api/v1/killswitch/reset", post(reset_kill_switch))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create a minimal health-only router (for startup).
pub fn health_router() -> Router {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::strategy::kill_switch::KillSwitch;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::sync::{Arc, Mutex, RwLock};
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = test_config();
        AppState::new(
            Arc::new(Mutex::new(KillSwitch::new(&config))),
            Arc::new(RwLock::new(None)),
            Arc::new(RwLock::new(None)),
        )
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_ready() {
        let app = create_router(state());

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_ready() {
        let state = state();
        state.set_ready(true);
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_endpoint_reports_kill_switch() {
        let state = state();
        state.kill_switch.lock().unwrap().record_fill(Some(true), None);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kill_switch"]["tripped"], true);
    }

    #[tokio::test]
    async fn killswitch_reset_endpoint_resets() {
        let state = state();
        state.kill_switch.lock().unwrap().record_fill(Some(true), None);
        let app = create_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/killswitch/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.kill_switch.lock().unwrap().entries_allowed());
    }
}
