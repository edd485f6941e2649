use beacon_core::BeaconError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error. The store is treated as unavailable.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job path contains characters that cannot be routed.
    #[error("Invalid job path: {0}")]
    InvalidPath(String),

    /// A live job already exists at this path.
    #[error("Job already exists: {path}")]
    Conflict { path: String },

    /// No job is registered at the given path.
    #[error("Job not found: {path}")]
    JobNotFound { path: String },

    /// No instance with the given ID exists, or it is not in a resettable state.
    #[error("Instance not found: {id}")]
    InstanceNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for BeaconError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Database(e) => BeaconError::StoreUnavailable(e.to_string()),
            SchedulerError::InvalidSchedule(_) | SchedulerError::InvalidPath(_) => {
                BeaconError::BadRequest(e.to_string())
            }
            SchedulerError::Conflict { path } => BeaconError::Conflict { path },
            SchedulerError::JobNotFound { path } => BeaconError::NotFound {
                what: format!("job {path}"),
            },
            SchedulerError::InstanceNotFound { id } => BeaconError::NotFound {
                what: format!("instance {id}"),
            },
        }
    }
}
