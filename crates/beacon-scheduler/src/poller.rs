use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::{error::Result, store::Store, types::DueInstance};

/// Finds due work. Never claims: the executor's conditional update is the
/// authoritative check, so a candidate may already be gone by the time it is
/// claimed.
pub struct Poller {
    store: Store,
    batch_size: usize,
    claim_timeout: TimeDelta,
    max_attempts: u32,
}

impl Poller {
    pub fn new(store: Store, batch_size: usize, claim_timeout: TimeDelta, max_attempts: u32) -> Self {
        Self {
            store,
            batch_size,
            claim_timeout,
            max_attempts,
        }
    }

    /// One poll cycle: housekeeping on abandoned rows, then the next batch of
    /// candidates ordered by `run_at` (ties by job path).
    pub fn poll(&self, now: DateTime<Utc>) -> Result<Vec<DueInstance>> {
        let stale_before = now - self.claim_timeout;

        let exhausted = self
            .store
            .fail_exhausted_stale(now, stale_before, self.max_attempts)?;
        if exhausted > 0 {
            warn!(count = exhausted, "abandoned instances on their final attempt marked failed");
        }
        let purged = self.store.purge_orphans(stale_before)?;
        if purged > 0 {
            debug!(count = purged, "orphaned instances purged");
        }

        let due = self
            .store
            .due_instances(now, stale_before, self.max_attempts, self.batch_size)?;
        if !due.is_empty() {
            debug!(count = due.len(), "due instances found");
        }
        Ok(due)
    }
}
