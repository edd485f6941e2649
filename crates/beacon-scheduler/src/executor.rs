use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::Dispatch,
    error::Result,
    schedule::{next_run, Backoff},
    store::{Claim, Completion, FailureAction, FailureRecord, Store},
    types::{DueInstance, Instance, Job},
};

/// An instance this worker holds the claim on, plus the job it fires.
#[derive(Debug, Clone)]
pub struct ClaimedInstance {
    pub instance: Instance,
    pub job: Job,
}

/// What happened to a claimed instance after its dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered; no further firing (one-off, or the job was unregistered).
    Done,
    /// Delivered; the next firing is scheduled.
    Rescheduled { next_run_at: DateTime<Utc> },
    /// Failed; will be retried at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Failed on the last permitted attempt. Terminal.
    Failed,
    /// Failed after the job was unregistered; the instance was dropped.
    Dropped,
    /// Our claim expired mid-dispatch and another worker took over.
    ClaimLost,
}

/// Claims due instances, dispatches them and records the result.
pub struct Executor {
    store: Store,
    dispatcher: Arc<dyn Dispatch>,
    worker_id: String,
    claim_timeout: TimeDelta,
    max_attempts: u32,
    backoff: Backoff,
}

impl Executor {
    pub fn new(
        store: Store,
        dispatcher: Arc<dyn Dispatch>,
        worker_id: impl Into<String>,
        claim_timeout: TimeDelta,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            dispatcher,
            worker_id: worker_id.into(),
            claim_timeout,
            max_attempts,
            backoff,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Try to take exclusive ownership of a candidate.
    ///
    /// `Ok(None)` means another worker won the race; that is not an error.
    pub fn claim(&self, due: &DueInstance, now: DateTime<Utc>) -> Result<Option<ClaimedInstance>> {
        match self.store.claim(
            &due.instance.id,
            &self.worker_id,
            now,
            now - self.claim_timeout,
            self.max_attempts,
        )? {
            Claim::Won(instance) => {
                debug!(
                    instance_id = %instance.id,
                    job_path = %due.job.path,
                    attempt = instance.attempt,
                    "instance claimed"
                );
                Ok(Some(ClaimedInstance {
                    instance,
                    job: due.job.clone(),
                }))
            }
            Claim::Lost => {
                debug!(instance_id = %due.instance.id, "claim lost to another worker");
                Ok(None)
            }
        }
    }

    /// Dispatch a claimed instance and persist the outcome.
    ///
    /// A store error while recording leaves the row `running`; it becomes
    /// claimable again once the claim times out.
    pub async fn execute(&self, claimed: ClaimedInstance) -> Result<Outcome> {
        let ClaimedInstance { instance, job } = claimed;
        let result = self.dispatcher.dispatch(&job.path, &job.body).await;
        let now = Utc::now();

        match result {
            Ok(()) => self.record_success(&instance, &job, now),
            Err(e) => self.record_failure(&instance, &job, now, &e.to_string()),
        }
    }

    /// [`execute`](Self::execute), with errors logged instead of returned.
    pub async fn run(&self, claimed: ClaimedInstance) {
        let instance_id = claimed.instance.id.clone();
        let job_path = claimed.job.path.clone();
        if let Err(e) = self.execute(claimed).await {
            error!(%instance_id, %job_path, "failed to record dispatch outcome: {e}");
        }
    }

    fn record_success(&self, instance: &Instance, job: &Job, now: DateTime<Utc>) -> Result<Outcome> {
        let next_run_at = if job.one_off {
            None
        } else {
            // step from the slot, not from a retry's backed-off run_at
            job.interval()
                .map(|interval| next_run(instance.scheduled_at, interval, now))
        };

        let outcome = match self
            .store
            .complete(instance, &self.worker_id, now, next_run_at)?
        {
            Completion::Done => Outcome::Done,
            Completion::Rescheduled(next) => Outcome::Rescheduled {
                next_run_at: next.run_at,
            },
            Completion::ClaimLost => Outcome::ClaimLost,
        };

        match &outcome {
            Outcome::ClaimLost => warn!(
                instance_id = %instance.id,
                job_path = %job.path,
                "dispatch succeeded but claim was taken over; result discarded"
            ),
            Outcome::Rescheduled { next_run_at } => info!(
                instance_id = %instance.id,
                job_path = %job.path,
                attempt = instance.attempt,
                next_run_at = %next_run_at,
                "dispatched; next firing scheduled"
            ),
            _ => info!(
                instance_id = %instance.id,
                job_path = %job.path,
                attempt = instance.attempt,
                "dispatched"
            ),
        }
        Ok(outcome)
    }

    fn record_failure(
        &self,
        instance: &Instance,
        job: &Job,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Outcome> {
        let action = if instance.attempt < self.max_attempts {
            let delay = self.backoff.delay_delta(instance.attempt);
            let run_at = now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            FailureAction::Retry { run_at }
        } else {
            FailureAction::Fail
        };

        let record = self
            .store
            .record_failure(instance, &self.worker_id, now, reason, action)?;
        let outcome = match record {
            FailureRecord::Retrying { run_at } => {
                warn!(
                    instance_id = %instance.id,
                    job_path = %job.path,
                    attempt = instance.attempt,
                    max_attempts = self.max_attempts,
                    retry_at = %run_at,
                    "dispatch failed, will retry: {reason}"
                );
                Outcome::Retrying { run_at }
            }
            FailureRecord::Failed => {
                error!(
                    instance_id = %instance.id,
                    job_path = %job.path,
                    attempt = instance.attempt,
                    "dispatch failed, retries exhausted: {reason}"
                );
                Outcome::Failed
            }
            FailureRecord::Orphaned => {
                info!(
                    instance_id = %instance.id,
                    job_path = %job.path,
                    "dispatch failed for unregistered job; dropped"
                );
                Outcome::Dropped
            }
            FailureRecord::ClaimLost => {
                warn!(
                    instance_id = %instance.id,
                    job_path = %job.path,
                    "dispatch failed and claim was taken over; result discarded"
                );
                Outcome::ClaimLost
            }
        };
        Ok(outcome)
    }
}
