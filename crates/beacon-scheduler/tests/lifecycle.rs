// End-to-end scheduling against a real HTTP target and an on-disk store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use beacon_core::config::SchedulerConfig;
use beacon_scheduler::{
    HttpDispatcher, InstanceStatus, JobPath, JobRegistry, Registration, Schedule,
    SchedulerEngine, Store,
};
use chrono::{TimeDelta, TimeZone, Utc};
use tokio::sync::{mpsc, watch};

const TEST_BODY: &str = "testBody";
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Call {
    path: String,
    body: String,
    at: Instant,
}

#[derive(Clone)]
struct Target {
    calls: mpsc::UnboundedSender<Call>,
    hits: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    status: StatusCode,
    delay: Duration,
}

async fn endpoint(
    State(target): State<Target>,
    Path(path): Path<String>,
    body: String,
) -> StatusCode {
    target.hits.fetch_add(1, Ordering::SeqCst);
    let now_serving = target.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    target.peak.fetch_max(now_serving, Ordering::SeqCst);
    let _ = target.calls.send(Call {
        path,
        body,
        at: Instant::now(),
    });
    tokio::time::sleep(target.delay).await;
    target.in_flight.fetch_sub(1, Ordering::SeqCst);
    target.status
}

/// Spawn a target server; returns its base URL.
async fn spawn_target(target: Target) -> String {
    let app = Router::new()
        .route("/{path}", post(endpoint))
        .with_state(target);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    registry: JobRegistry,
    calls: mpsc::UnboundedReceiver<Call>,
    hits: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    db_path: std::path::PathBuf,
    base_url: String,
    _dir: tempfile::TempDir,
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 100,
        claim_timeout_secs: 30,
        max_concurrency: 4,
        batch_size: 10,
        max_attempts: 3,
        retry_base_ms: 50,
        retry_max_ms: 200,
        worker_id: None,
    }
}

fn start_engine(
    store: Store,
    base_url: &str,
    cfg: &SchedulerConfig,
) -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let dispatcher = HttpDispatcher::new(base_url, Duration::from_secs(3)).unwrap();
    let engine = SchedulerEngine::new(store, Arc::new(dispatcher), cfg);
    let done = engine.notify_done();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(engine.run(shutdown_rx));
    (shutdown_tx, done)
}

async fn start(status: StatusCode, delay: Duration) -> Harness {
    start_with(status, delay, &test_config()).await
}

async fn start_with(status: StatusCode, delay: Duration, cfg: &SchedulerConfig) -> Harness {
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let hits = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_target(Target {
        calls: calls_tx,
        hits: Arc::clone(&hits),
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
        status,
        delay,
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("beacon.db");
    let registry = JobRegistry::new(Store::open(&db_path).unwrap());
    let (shutdown, done) = start_engine(Store::open(&db_path).unwrap(), &base_url, cfg);

    Harness {
        registry,
        calls,
        hits,
        peak,
        shutdown,
        done,
        db_path,
        base_url,
        _dir: dir,
    }
}

impl Harness {
    async fn stop(mut self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, self.done.wait_for(|d| *d))
            .await
            .expect("engine did not drain in time")
            .unwrap();
    }
}

fn reg(path: &str, schedule: Schedule) -> Registration {
    Registration {
        path: JobPath::parse(path).unwrap(),
        body: TEST_BODY.as_bytes().to_vec(),
        schedule,
        replace: false,
    }
}

fn done_count(registry: &JobRegistry) -> u64 {
    registry
        .status_counts()
        .unwrap()
        .into_iter()
        .find(|(status, _)| *status == InstanceStatus::Done)
        .map_or(0, |(_, n)| n)
}

#[tokio::test]
async fn one_off_job_in_the_past_is_dispatched_exactly_once() {
    let mut h = start(StatusCode::OK, Duration::ZERO).await;
    let first_run = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
    h.registry
        .register(reg(
            "testPath",
            Schedule::OneOff {
                first_run: Some(first_run),
            },
        ))
        .unwrap();

    let call = tokio::time::timeout(TEST_TIMEOUT, h.calls.recv())
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(call.path, "testPath");
    assert_eq!(call.body, TEST_BODY);

    // no second delivery
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);

    // delivered one-off jobs are gone; the instance stays as history
    let path = JobPath::parse("testPath").unwrap();
    assert!(h.registry.get(&path).unwrap().is_none());
    assert_eq!(done_count(&h.registry), 1);

    // and the path can be registered again
    h.registry
        .register(reg("testPath", Schedule::OneOff { first_run: None }))
        .unwrap();
    tokio::time::timeout(TEST_TIMEOUT, h.calls.recv())
        .await
        .expect("re-registered job never fired")
        .unwrap();
    h.stop().await;
}

#[tokio::test]
async fn recurring_job_fires_on_its_interval() {
    let mut h = start(StatusCode::OK, Duration::ZERO).await;
    let registered = Instant::now();
    h.registry
        .register(reg(
            "heartbeat",
            Schedule::Recurring {
                interval: TimeDelta::seconds(2),
                first_run: None,
            },
        ))
        .unwrap();

    let deadline = registered + TEST_TIMEOUT;
    let first = tokio::time::timeout_at(deadline.into(), h.calls.recv())
        .await
        .expect("first firing")
        .unwrap();
    let second = tokio::time::timeout_at(deadline.into(), h.calls.recv())
        .await
        .expect("second firing")
        .unwrap();

    let gap = second.at - first.at;
    assert!(
        gap >= Duration::from_millis(1500) && gap <= Duration::from_millis(2500),
        "firings should be ~2s apart, got {gap:?}"
    );
    h.stop().await;
}

#[tokio::test]
async fn unregistered_job_is_never_dispatched() {
    let h = start(StatusCode::OK, Duration::ZERO).await;
    let path = JobPath::parse("cancelled").unwrap();
    h.registry
        .register(reg(
            "cancelled",
            Schedule::OneOff {
                first_run: Some(Utc::now() + TimeDelta::milliseconds(500)),
            },
        ))
        .unwrap();
    h.registry.unregister(&path).unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    assert!(h.registry.get(&path).unwrap().is_none());
    h.stop().await;
}

#[tokio::test]
async fn failing_target_exhausts_retries_then_stops() {
    let h = start(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;
    h.registry
        .register(reg("broken", Schedule::OneOff { first_run: None }))
        .unwrap();

    let started = Instant::now();
    let failed = loop {
        let failed = h.registry.failed_instances(10).unwrap();
        if !failed.is_empty() {
            break failed;
        }
        assert!(started.elapsed() < TEST_TIMEOUT, "instance never reached failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("target returned HTTP 500"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.hits.load(Ordering::SeqCst), 3);

    // operator reset puts it back in the queue for another round
    h.registry.reset_instance(&failed[0].id).unwrap();
    let started = Instant::now();
    while h.hits.load(Ordering::SeqCst) < 4 {
        assert!(started.elapsed() < TEST_TIMEOUT, "reset instance never retried");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    h.stop().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_dispatch() {
    let mut h = start(StatusCode::OK, Duration::from_millis(800)).await;
    h.registry
        .register(reg("slow", Schedule::OneOff { first_run: None }))
        .unwrap();

    // the target has the request; the response is still 800ms away
    tokio::time::timeout(TEST_TIMEOUT, h.calls.recv())
        .await
        .expect("dispatch never started")
        .unwrap();

    let registry = h.registry.clone();
    h.stop().await;

    assert_eq!(done_count(&registry), 1);
    assert!(registry.get(&JobPath::parse("slow").unwrap()).unwrap().is_none());
}

#[tokio::test]
async fn two_engines_share_the_work_without_duplicates() {
    let mut h = start(StatusCode::OK, Duration::ZERO).await;
    // a second worker against the same database file
    let (second_shutdown, mut second_done) =
        start_engine(Store::open(&h.db_path).unwrap(), &h.base_url, &test_config());

    const JOBS: usize = 20;
    for i in 0..JOBS {
        h.registry
            .register(reg(&format!("job-{i}"), Schedule::OneOff { first_run: None }))
            .unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..JOBS {
        let call = tokio::time::timeout(TEST_TIMEOUT, h.calls.recv())
            .await
            .expect("missing dispatch")
            .unwrap();
        assert!(seen.insert(call.path.clone()), "duplicate dispatch of {}", call.path);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.hits.load(Ordering::SeqCst), JOBS);

    second_shutdown.send(true).unwrap();
    second_done.wait_for(|d| *d).await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn locked_store_stalls_polling_until_released() {
    let (calls_tx, mut calls) = mpsc::unbounded_channel();
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_target(Target {
        calls: calls_tx,
        hits: Arc::clone(&hits),
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
        status: StatusCode::OK,
        delay: Duration::ZERO,
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("beacon.db");
    let registry = JobRegistry::new(Store::open(&db_path).unwrap());
    registry
        .register(reg("patient", Schedule::OneOff { first_run: None }))
        .unwrap();

    // another process holds the write lock; every poll gives up after 100ms
    let engine_store =
        Store::open_with_busy_timeout(&db_path, Duration::from_millis(100)).unwrap();
    let blocker = rusqlite::Connection::open(&db_path).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let (shutdown, mut done) = start_engine(engine_store, &base_url, &test_config());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    blocker.execute_batch("COMMIT").unwrap();
    let call = tokio::time::timeout(TEST_TIMEOUT, calls.recv())
        .await
        .expect("engine never recovered from the locked store")
        .unwrap();
    assert_eq!(call.path, "patient");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(done_count(&registry), 1);

    shutdown.send(true).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, done.wait_for(|d| *d))
        .await
        .expect("engine did not drain in time")
        .unwrap();
}

#[tokio::test]
async fn max_concurrency_bounds_in_flight_dispatches() {
    let cfg = SchedulerConfig {
        max_concurrency: 1,
        ..test_config()
    };
    let mut h = start_with(StatusCode::OK, Duration::from_millis(300), &cfg).await;

    const JOBS: usize = 3;
    for i in 0..JOBS {
        h.registry
            .register(reg(&format!("serial-{i}"), Schedule::OneOff { first_run: None }))
            .unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..JOBS {
        let call = tokio::time::timeout(TEST_TIMEOUT, h.calls.recv())
            .await
            .expect("missing dispatch")
            .unwrap();
        seen.insert(call.path);
    }
    assert_eq!(seen.len(), JOBS);

    let registry = h.registry.clone();
    let peak = Arc::clone(&h.peak);
    h.stop().await;

    assert_eq!(peak.load(Ordering::SeqCst), 1, "target saw overlapping requests");
    assert_eq!(done_count(&registry), JOBS as u64);
}
