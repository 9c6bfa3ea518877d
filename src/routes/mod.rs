//! HTTP routes

pub mod health;
pub mod indicators;
pub mod metrics;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and metrics (Kubernetes probes + Prometheus)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Indicators
        .route(
            "/api/v1/indicators/{id}/execute",
            post(indicators::execute_indicator),
        )
        .route(
            "/api/v1/indicators/{id}/executions",
            get(indicators::list_executions),
        )
        // WebSocket streaming
        .route("/api/v1/events/ws", get(ws::ws_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
