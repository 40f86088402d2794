// =============================================================================
// Basis Radar — Main Entry Point
// =============================================================================
//
//   basis-radar [run]                 scheduler loop plus dashboard API
//   basis-radar once                  single pipeline run; non-zero exit on failure
//   basis-radar archive [--date D]    write one UTC day of history to disk

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod archive;
mod market_data;
mod metrics;
mod notify;
mod pipeline;
mod runtime_config;
mod signals;
mod stats;
mod storage;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::DeribitClient;
use crate::pipeline::Pipeline;
use crate::runtime_config::RuntimeConfig;
use crate::storage::JsonlHistoryStore;

const DEFAULT_CONFIG_PATH: &str = "basis_radar.json";

/// Futures basis monitor: term-structure, historical and cross-sectional
/// z-scores with alerting and a dashboard API.
#[derive(Parser, Debug)]
#[command(name = "basis-radar", version)]
struct Cli {
    /// Runtime configuration file (written with defaults on first start)
    #[arg(long, global = true, env = "BASIS_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Scheduler loop plus dashboard API (the default)
    Run,
    /// One pipeline run, then exit
    Once,
    /// Write one UTC day of stored rows to the archive directory
    Archive {
        /// Day to archive, YYYY-MM-DD (defaults to yesterday)
        #[arg(long, env = "ARB_ARCHIVE_DATE")]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let config_path = cli.config;
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        // First start: leave an editable copy of the defaults behind.
        if !Path::new(&config_path).exists() {
            if let Err(e) = defaults.save(&config_path) {
                warn!(error = %e, "failed to write default config");
            }
        }
        defaults
    });
    config.apply_env_overrides();

    info!(
        ?command,
        base = %config.app.base_asset,
        quote = %config.app.quote_asset,
        history = %config.history.path,
        "basis radar starting"
    );

    let store = Arc::new(JsonlHistoryStore::new(&config.history.path));

    match command {
        Command::Archive { date } => run_archive(&config, &store, date.as_deref()).await,
        Command::Once => {
            let pipeline = build_pipeline(&config, store);
            let report = pipeline.run_once(&config).await?;
            info!(run_id = %report.run_id, signals = report.signal_count(), "single run finished");
            Ok(())
        }
        Command::Run => run_scheduler(config, store).await,
    }
}

fn build_pipeline(config: &RuntimeConfig, store: Arc<JsonlHistoryStore>) -> Pipeline {
    let sinks = notify::build_sinks(&config.notifications);
    info!(channels = sinks.len(), "alert channels configured");
    Pipeline::new(Arc::new(DeribitClient::new()), store, sinks)
}

async fn run_archive(
    config: &RuntimeConfig,
    store: &JsonlHistoryStore,
    date: Option<&str>,
) -> anyhow::Result<()> {
    let requested = date.map(str::trim).filter(|d| !d.is_empty());
    let date = archive::target_date(requested, chrono::Utc::now())?;
    archive::archive_day(store, Path::new(&config.archive.out_dir), date).await?;
    Ok(())
}

async fn run_scheduler(config: RuntimeConfig, store: Arc<JsonlHistoryStore>) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config, store.clone());
    let poll_secs = config.app.poll_interval_secs.max(1);
    let api_cfg = config.api.clone();
    let state = Arc::new(AppState::new(config, store));

    // ── Dashboard API ────────────────────────────────────────────────────
    if api_cfg.enabled {
        let listener = tokio::net::TcpListener::bind(&api_cfg.bind_addr)
            .await
            .with_context(|| format!("failed to bind API server to {}", api_cfg.bind_addr))?;
        info!(addr = %api_cfg.bind_addr, "API server listening");
        let app = api::rest::router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    // ── Scheduler loop ───────────────────────────────────────────────────
    let loop_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(poll_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match pipeline.run_once(&loop_state.runtime_config).await {
                Ok(report) => loop_state.record_run(report),
                Err(e) => {
                    let msg = format!("{e:#}");
                    error!(error = %msg, "run failed");
                    loop_state.push_error(msg);
                }
            }
        }
    });

    info!(poll_secs, "scheduler running. Press Ctrl+C to stop.");

    // ── Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");
    info!("basis radar shut down complete.");
    Ok(())
}
