//! Outbound delivery of job payloads to the configured target.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::debug;

use crate::types::JobPath;

/// Why a dispatch did not succeed. Every variant is retried by the executor.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connection refused, DNS failure, reset, or the call timed out.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The target answered outside the 2xx range.
    #[error("target returned HTTP {status}")]
    Status { status: u16 },
}

/// Delivers a job's payload for one firing.
///
/// `HttpDispatcher` is the production implementation; tests plug in their own.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, path: &JobPath, body: &[u8]) -> Result<(), DispatchError>;
}

/// POSTs payloads to `<base_url>/<job path>`.
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDispatcher {
    /// Build a dispatcher whose calls are bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn target_url(&self, path: &JobPath) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, path: &JobPath, body: &[u8]) -> Result<(), DispatchError> {
        let url = self.target_url(path);
        debug!(%url, bytes = body.len(), "dispatching");
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body.to_vec())
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Status {
                status: status.as_u16(),
            })
        }
    }
}
