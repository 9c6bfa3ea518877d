//! Manual trigger and execution history endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::ExecutionRecord;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// POST /api/v1/indicators/{id}/execute
///
/// Runs the indicator now through the regular pipeline. 409 if it is
/// already running, 404 if it does not exist.
pub async fn execute_indicator(
    State(state): State<AppState>,
    Path(indicator_id): Path<i64>,
) -> Result<Json<ExecutionRecord>> {
    info!(indicator_id, "Manual execution requested");
    let record = state.orchestrator.execute_now(indicator_id).await?;
    Ok(Json(record))
}

/// GET /api/v1/indicators/{id}/executions?limit=
pub async fn list_executions(
    State(state): State<AppState>,
    Path(indicator_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ExecutionRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit < 1 {
        return Err(AppError::InvalidRequest(format!(
            "limit must be positive, got {limit}"
        )));
    }

    let records = state
        .orchestrator
        .history()
        .recent(indicator_id, limit.min(MAX_HISTORY_LIMIT))
        .await?;
    Ok(Json(records))
}
