use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beacon_core::BeaconError;
use beacon_scheduler::SchedulerError;
use serde_json::json;
use tracing::warn;

/// Handler error: renders a [`BeaconError`] as `{"error", "code"}` JSON.
#[derive(Debug)]
pub struct ApiError(pub BeaconError);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BeaconError::BadRequest(msg.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            BeaconError::Conflict { .. } => StatusCode::CONFLICT,
            BeaconError::NotFound { .. } => StatusCode::NOT_FOUND,
            BeaconError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BeaconError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BeaconError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), "request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (
                ApiError::from(SchedulerError::Conflict {
                    path: "p".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(SchedulerError::JobNotFound {
                    path: "p".to_string(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(SchedulerError::InvalidSchedule("x".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SchedulerError::Database(
                    rusqlite::Error::InvalidQuery,
                )),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError(BeaconError::Config("boom".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.status(), want, "{:?}", err.0);
        }
    }
}
