use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};

use crate::error::{Result, SchedulerError};

/// Longest accepted job path, in bytes.
pub const MAX_PATH_LEN: usize = 255;

/// Validated job path: registry key and dispatch URL suffix at once.
///
/// Only RFC 3986 unreserved characters are allowed, so the value can be
/// appended to the endpoint base URL without escaping and can never smuggle
/// in extra path segments, a query string or a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobPath(String);

impl JobPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(SchedulerError::InvalidPath("path is empty".to_string()));
        }
        if raw.len() > MAX_PATH_LEN {
            return Err(SchedulerError::InvalidPath(format!(
                "path exceeds {MAX_PATH_LEN} bytes"
            )));
        }
        if raw == "." || raw == ".." {
            return Err(SchedulerError::InvalidPath(format!("{raw:?} is reserved")));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')))
        {
            return Err(SchedulerError::InvalidPath(format!(
                "character {bad:?} is not allowed in a job path"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for JobPath {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire exactly once, at `first_run` or immediately when unset.
    OneOff { first_run: Option<DateTime<Utc>> },

    /// Fire every `interval`. The first firing is `first_run` when given,
    /// otherwise one interval after registration.
    Recurring {
        interval: TimeDelta,
        first_run: Option<DateTime<Utc>>,
    },
}

impl Schedule {
    pub fn is_one_off(&self) -> bool {
        matches!(self, Schedule::OneOff { .. })
    }

    pub fn interval(&self) -> Option<TimeDelta> {
        match self {
            Schedule::OneOff { .. } => None,
            Schedule::Recurring { interval, .. } => Some(*interval),
        }
    }
}

/// Everything needed to register a job.
#[derive(Debug, Clone)]
pub struct Registration {
    pub path: JobPath,
    /// Opaque payload replayed verbatim on every firing.
    pub body: Vec<u8>,
    pub schedule: Schedule,
    /// Replace an existing job at the same path instead of failing with `Conflict`.
    pub replace: bool,
}

/// Lifecycle state of a single firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting for `run_at`, or waiting for a retry.
    Pending,
    /// Claimed by a worker; the dispatch is in flight.
    Running,
    /// Delivered successfully. Terminal.
    Done,
    /// Retry ceiling exhausted. Terminal until an operator resets it.
    Failed,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 4] = [
        InstanceStatus::Pending,
        InstanceStatus::Running,
        InstanceStatus::Done,
        InstanceStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Done => "done",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "done" => Ok(InstanceStatus::Done),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// UUID v7 generation id. Re-registering a path yields a new id.
    pub id: String,
    pub path: JobPath,
    /// Payload bytes; rendered lossily as UTF-8 in JSON.
    #[serde(serialize_with = "body_as_text")]
    pub body: Vec<u8>,
    /// Milliseconds between firings; `None` for one-off jobs.
    pub interval_ms: Option<i64>,
    pub one_off: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn interval(&self) -> Option<TimeDelta> {
        self.interval_ms
            .filter(|ms| *ms > 0)
            .map(TimeDelta::milliseconds)
    }
}

fn body_as_text<S: Serializer>(body: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(body))
}

/// One scheduled firing of a job.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    /// UUID v7 primary key.
    pub id: String,
    /// Generation id of the owning job (look-up only, never cascades).
    pub job_id: String,
    pub job_path: String,
    /// When the next attempt may run. Retries push it back by the backoff.
    pub run_at: DateTime<Utc>,
    /// The slot this firing was scheduled for; recurring jobs step from here.
    pub scheduled_at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Dispatch attempts made so far for this firing.
    pub attempt: u32,
    /// Reason of the most recent failed attempt.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A due instance together with the job generation it belongs to.
#[derive(Debug, Clone)]
pub struct DueInstance {
    pub instance: Instance,
    pub job: Job,
}
