use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use beacon_core::BeaconConfig;
use beacon_scheduler::JobRegistry;

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub config: BeaconConfig,
    pub registry: JobRegistry,
}

impl AppState {
    pub fn new(config: BeaconConfig, registry: JobRegistry) -> Self {
        Self { config, registry }
    }
}

/// Assemble the management API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/jobs/{path}/{body}", put(crate::http::jobs::register_job))
        .route(
            "/jobs/{path}",
            get(crate::http::jobs::get_job).delete(crate::http::jobs::delete_job),
        )
        .route(
            "/instances/failed",
            get(crate::http::instances::list_failed),
        )
        .route(
            "/instances/{id}/reset",
            post(crate::http::instances::reset_instance),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
