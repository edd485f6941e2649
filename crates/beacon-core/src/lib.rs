//! `beacon-core`: configuration and the process-wide error type shared by
//! the scheduler engine and the management gateway.

pub mod config;
pub mod error;

pub use config::BeaconConfig;
pub use error::{BeaconError, Result};
