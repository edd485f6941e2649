//! `beacon-scheduler`: durable job scheduling and HTTP dispatch on SQLite.
//!
//! # Overview
//!
//! Jobs live in a `jobs` table; every scheduled firing is a row in
//! `instances`. Any number of [`engine::SchedulerEngine`]s (in one process or
//! many) may poll the same database. Each due instance is claimed with a
//! single conditional `UPDATE`, so exactly one worker dispatches it, and a
//! claim whose holder stops making progress expires after the claim timeout.
//!
//! # Instance lifecycle
//!
//! | From      | Event                                  | To                   |
//! |-----------|----------------------------------------|----------------------|
//! | `pending` | claimed (`run_at <= now`)              | `running`            |
//! | `running` | target answered 2xx                    | `done` (+ next firing for recurring jobs) |
//! | `running` | failure, attempts left                 | `pending` (backoff)  |
//! | `running` | failure, retry ceiling reached         | `failed`             |
//! | `running` | claim timed out                        | re-claimable         |
//! | `failed`  | operator reset                         | `pending`            |

pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod poller;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

pub use dispatch::{Dispatch, DispatchError, HttpDispatcher};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use registry::JobRegistry;
pub use store::Store;
pub use types::{Instance, InstanceStatus, Job, JobPath, Registration, Schedule};
