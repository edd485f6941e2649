use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use beacon_scheduler::Instance;
use serde::Deserialize;

use crate::app::AppState;
use crate::http::error::ApiError;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<usize>,
}

/// GET /instances/failed?limit=N: instances that exhausted their retries.
pub async fn list_failed(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.registry.failed_instances(limit)?))
}

/// POST /instances/{id}/reset: requeue a failed instance with a fresh attempt budget.
pub async fn reset_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    Ok(Json(state.registry.reset_instance(&id)?))
}
