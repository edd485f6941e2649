pub mod error;
pub mod health;
pub mod instances;
pub mod jobs;
