use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::error::ApiError;

/// GET /health: liveness probe plus instance counts per status.
///
/// A store outage surfaces as 503 so load balancers stop routing here.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let counts: BTreeMap<&'static str, u64> = state
        .registry
        .status_counts()?
        .into_iter()
        .map(|(status, n)| (status.as_str(), n))
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoint": state.config.endpoint.base_url,
        "instances": counts,
    })))
}
