use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod http;

#[derive(Debug, Parser)]
#[command(name = "beacon-gateway", version, about = "Durable HTTP job scheduler")]
struct Cli {
    /// Config file (falls back to BEACON_CONFIG, then ~/.beacon/beacon.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Create the database tables and exit
    #[arg(long)]
    create_tables: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "beacon_gateway=info,beacon_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > BEACON_CONFIG env > ~/.beacon/beacon.toml
    let config_path = cli.config.or_else(|| std::env::var("BEACON_CONFIG").ok());
    let config = load_config(config_path.as_deref())?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // opening bootstraps the schema (idempotent)
    let busy_timeout = config.database.busy_timeout();
    let store = beacon_scheduler::Store::open_with_busy_timeout(db_path, busy_timeout)?;
    if cli.create_tables {
        info!("tables created");
        return Ok(());
    }

    let dispatcher =
        beacon_scheduler::HttpDispatcher::new(&config.endpoint.base_url, config.endpoint.timeout())?;
    info!(target_url = %config.endpoint.base_url, "dispatching to endpoint");

    // engine gets its own connection so HTTP traffic never queues behind a poll
    let engine = beacon_scheduler::SchedulerEngine::new(
        beacon_scheduler::Store::open_with_busy_timeout(db_path, busy_timeout)?,
        Arc::new(dispatcher),
        &config.scheduler,
    );
    let mut engine_done = engine.notify_done();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = config.listen.addr().parse()?;
    let registry = beacon_scheduler::JobRegistry::new(store);
    let state = Arc::new(app::AppState::new(config, registry));
    let router = app::build_router(state);

    info!("Beacon gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop claiming, then wait for in-flight dispatches to record their outcome
    let _ = shutdown_tx.send(true);
    let _ = engine_done.wait_for(|done| *done).await;
    info!("shutdown complete");
    Ok(())
}

/// A missing file means defaults; anything malformed or out of range is fatal.
fn load_config(path: Option<&str>) -> anyhow::Result<beacon_core::BeaconConfig> {
    let config = beacon_core::BeaconConfig::load(path)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    info!(path = path.unwrap_or("<default>"), "configuration loaded");
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
