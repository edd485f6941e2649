use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::SchedulerConfig;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dispatch::Dispatch,
    executor::Executor,
    poller::Poller,
    schedule::{to_delta, Backoff},
    store::Store,
};

/// Core scheduler loop: polls the store on a fixed tick and fans claimed
/// instances out to concurrent dispatch tasks.
pub struct SchedulerEngine {
    poller: Poller,
    executor: Arc<Executor>,
    poll_interval: Duration,
    max_concurrency: usize,
    done_tx: watch::Sender<bool>,
}

impl SchedulerEngine {
    /// Build an engine from scheduler settings. A worker id is generated when
    /// the config does not pin one.
    pub fn new(store: Store, dispatcher: Arc<dyn Dispatch>, cfg: &SchedulerConfig) -> Self {
        let worker_id = cfg
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple()));
        let claim_timeout = to_delta(cfg.claim_timeout());

        let poller = Poller::new(store.clone(), cfg.batch_size, claim_timeout, cfg.max_attempts);
        let executor = Executor::new(
            store,
            dispatcher,
            worker_id,
            claim_timeout,
            cfg.max_attempts,
            Backoff::new(cfg.retry_base(), cfg.retry_max()),
        );
        let (done_tx, _) = watch::channel(false);

        Self {
            poller,
            executor: Arc::new(executor),
            poll_interval: cfg.poll_interval(),
            max_concurrency: cfg.max_concurrency.max(1),
            done_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.executor.worker_id()
    }

    /// Flips to `true` once [`run`](Self::run) has stopped polling and every
    /// in-flight dispatch has recorded its result.
    pub fn notify_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Main event loop. Polls every `poll_interval` until `shutdown` broadcasts `true`.
    ///
    /// Shutdown stops new ticks and new claims immediately; dispatches already
    /// claimed run to completion before the done notification fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id(), "scheduler engine started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'ticks: loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'ticks,
                _ = interval.tick() => {}
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("dispatch task panicked: {e}");
                }
            }

            // StoreUnavailable: report and try again next tick.
            let candidates = match self.poller.poll(Utc::now()) {
                Ok(c) => c,
                Err(e) => {
                    warn!("poll failed, retrying next tick: {e}");
                    continue;
                }
            };

            for due in candidates {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break 'ticks,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break 'ticks,
                    },
                };

                match self.executor.claim(&due, Utc::now()) {
                    Ok(Some(claimed)) => {
                        let executor = Arc::clone(&self.executor);
                        in_flight.spawn(async move {
                            let _permit = permit;
                            executor.run(claimed).await;
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(instance_id = %due.instance.id, "claim failed, retrying next tick: {e}");
                        continue 'ticks;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "scheduler engine shutting down, draining dispatches");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("dispatch task panicked: {e}");
            }
        }
        debug!("all dispatches drained");
        self.done_tx.send_replace(true);
        info!("scheduler engine stopped");
    }
}

/// Resolves once `true` is broadcast, or when the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
