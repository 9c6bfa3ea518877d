//! Health and readiness endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: CheckStatus,
    pub scheduler: CheckStatus,
    pub outbox: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub healthy: bool,
    pub message: String,
}

/// GET /health
///
/// Basic health check - returns 200 if the server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ready
///
/// Ready when the indicator store answers and the scheduler is not stopping
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let store_check = match state.orchestrator.store().ping().await {
        Ok(()) => CheckStatus {
            healthy: true,
            message: "Connected".to_string(),
        },
        Err(e) => CheckStatus {
            healthy: false,
            message: format!("Connection failed: {}", e),
        },
    };

    let stopping = state.orchestrator.is_shutting_down();
    let scheduler_check = CheckStatus {
        healthy: !stopping,
        message: if stopping {
            "Shutting down".to_string()
        } else {
            format!("In flight: {}", state.orchestrator.guard().in_flight_count())
        },
    };

    let outbox_check = CheckStatus {
        healthy: !state.outbox.is_full(),
        message: format!(
            "Outbox length: {}/{}, dropped: {}",
            state.outbox.len(),
            state.outbox.capacity(),
            state.outbox.dropped()
        ),
    };

    let all_healthy = store_check.healthy && scheduler_check.healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks {
                store: store_check,
                scheduler: scheduler_check,
                outbox: outbox_check,
            },
        }),
    )
}
