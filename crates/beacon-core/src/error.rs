use thiserror::Error;

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job already exists: {path}")]
    Conflict { path: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl BeaconError {
    /// Short error code string returned to API clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            BeaconError::Config(_) => "CONFIG_ERROR",
            BeaconError::Conflict { .. } => "CONFLICT",
            BeaconError::NotFound { .. } => "NOT_FOUND",
            BeaconError::BadRequest(_) => "BAD_REQUEST",
            BeaconError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, BeaconError>;
