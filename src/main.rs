//! Doppelganger service
//!
//! Accepts mirrored traffic over HTTP, spools it, compares every event against the
//! configured shadows and serves records, daily stats and Prometheus metrics.
//!
//! Usage:
//!   doppelganger --config doppelganger.toml --listen 0.0.0.0:9090
//!
//! Environment Variables:
//!   DOPPELGANGER_CONFIG - Path to TOML config file
//!   DATABASE_PATH, LISTEN_ADDR, SHADOW_TARGETS, COLLECT_BUDGET_MS,
//!   INGEST_WORKERS, DEFAULT_PRIMARY_SERVICE - override config values
//!   RUST_LOG - tracing filter

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doppelganger::api::{create_router, AppState};
use doppelganger::comparison::{ComparisonEngine, ComparisonMetrics, HttpShadowTarget, ShadowTarget};
use doppelganger::config::ServiceConfig;
use doppelganger::ingest::{IngestWorkers, SqliteSpool};
use doppelganger::storage::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "doppelganger")]
#[command(about = "Shadow traffic comparison service")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "DOPPELGANGER_CONFIG", default_value = "doppelganger.toml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// SQLite database path (overrides config)
    #[arg(short, long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    let mut config = ServiceConfig::load_or_default(&args.config)?;
    config.apply_env()?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate()?;

    info!(
        "Comparing against {} shadow(s) with a {}ms budget",
        config.enabled_shadows().count(),
        config.collector.budget.as_millis()
    );
    for shadow in config.enabled_shadows() {
        info!("  - {} ({})", shadow.name, shadow.url);
    }

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let spool = Arc::new(SqliteSpool::open(&config.database_path, &config.ingest)?);
    let metrics = Arc::new(ComparisonMetrics::new());

    let client = HttpShadowTarget::default_client().context("Failed to build HTTP client")?;
    let targets: Vec<Arc<dyn ShadowTarget>> = config
        .enabled_shadows()
        .map(|s| {
            Arc::new(HttpShadowTarget::new(&s.name, &s.url, client.clone())) as Arc<dyn ShadowTarget>
        })
        .collect();

    let engine = Arc::new(ComparisonEngine::new(
        &config,
        targets,
        store.clone(),
        metrics.clone(),
    ));

    // First tick runs immediately, covering records left unaggregated by a crash
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_task = tokio::spawn(engine.aggregator().run_reconciliation(
        config.aggregation.reconcile_interval,
        config.aggregation.reconcile_batch,
        shutdown_rx,
    ));

    let workers = IngestWorkers::spawn(config.ingest.workers, spool.clone(), engine.clone());

    let app = create_router(AppState {
        store,
        spool,
        metrics,
    });
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        })
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    workers.shutdown().await;
    let _ = reconcile_task.await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doppelganger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
