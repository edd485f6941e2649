//! Job management endpoints: register, inspect and unregister by path.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, Path, State},
    http::StatusCode,
    Form, Json,
};
use beacon_scheduler::{schedule::parse_interval, JobPath, Registration, Schedule};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::http::error::ApiError;

/// Form fields accepted by `PUT /jobs/{path}/{body}`.
///
/// Everything arrives as text so malformed values produce a 400 with a
/// message naming the field instead of a generic deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterForm {
    #[serde(rename = "one-off")]
    one_off: Option<String>,
    #[serde(rename = "first-run")]
    first_run: Option<String>,
    interval: Option<String>,
    replace: Option<String>,
}

impl RegisterForm {
    fn into_registration(self, path: JobPath, body: String) -> Result<Registration, ApiError> {
        let one_off = parse_flag("one-off", self.one_off.as_deref())?;
        let replace = parse_flag("replace", self.replace.as_deref())?;
        let first_run = self
            .first_run
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(parse_first_run)
            .transpose()?;

        let schedule = if one_off {
            Schedule::OneOff { first_run }
        } else {
            let raw = self
                .interval
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ApiError::bad_request("interval is required for recurring jobs"))?;
            Schedule::Recurring {
                interval: parse_interval(raw)?,
                first_run,
            }
        };

        Ok(Registration {
            path,
            body: body.into_bytes(),
            schedule,
            replace,
        })
    }
}

fn parse_flag(field: &str, raw: Option<&str>) -> Result<bool, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(false),
        Some("true" | "1" | "yes" | "on") => Ok(true),
        Some("false" | "0" | "no" | "off") => Ok(false),
        Some(other) => Err(ApiError::bad_request(format!(
            "{field} must be a boolean, got {other:?}"
        ))),
    }
}

fn parse_first_run(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::bad_request(format!("first-run is not RFC 3339 ({e}): {raw:?}")))
}

/// PUT /jobs/{path}/{body}
///
/// The trailing segment is the payload replayed on every dispatch. Returns
/// 201 with the job and its first instance, 409 if the path is taken.
pub async fn register_job(
    State(state): State<Arc<AppState>>,
    Path((path, body)): Path<(String, String)>,
    form: Result<Form<RegisterForm>, FormRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Form(form) = form.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let path = JobPath::parse(&path)?;
    let reg = form.into_registration(path, body)?;

    let (job, first) = state.registry.register(reg)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job": job, "instance": first })),
    ))
}

/// GET /jobs/{path}: the job and every instance of its current generation.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = JobPath::parse(&path)?;
    let (job, instances) = state
        .registry
        .get(&path)?
        .ok_or_else(|| beacon_scheduler::SchedulerError::JobNotFound {
            path: path.to_string(),
        })?;
    Ok(Json(json!({ "job": job, "instances": instances })))
}

/// DELETE /jobs/{path}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let path = JobPath::parse(&path)?;
    state.registry.unregister(&path)?;
    info!(job_path = %path, "job deleted via API");
    Ok(StatusCode::NO_CONTENT)
}
