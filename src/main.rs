//! Analysis gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!   coordinator ──HTTP──▶ admin API ──▶ Dispatcher ──▶ ReplicaSet.select()
//!                                           │                 │
//!                                           ▼                 ▼
//!                                    ConnectionPool ◀── CircuitBreaker
//!                                     (semaphore,           │
//!                                   idle cache, tasks,      ▼
//!                                       dedup)       analyzer replicas
//!                                           │          (WebSocket)
//!                                           ▼
//!                                  stream: progress*, terminal
//!
//!   background: health monitor (health checks), idle sweeper
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use analysis_gateway::admin::setup_admin_router;
use analysis_gateway::config::loader::load_config;
use analysis_gateway::config::{GatewayConfig, LogFormat};
use analysis_gateway::health::HealthMonitor;
use analysis_gateway::lifecycle::{signals, worker, BackgroundWorker, Shutdown};
use analysis_gateway::observability::{logging, metrics};
use analysis_gateway::pool::IdleSweeper;
use analysis_gateway::transport::WebSocketConnector;
use analysis_gateway::Dispatcher;

const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "analysis-gateway")]
#[command(about = "Dispatch gateway for containerized analyzer replicas", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        config.observability.log_format
    };
    logging::init_logging(&level, format)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "analysis-gateway starting");
    tracing::info!(
        services = config.services.len(),
        max_connections = config.pool.max_connections,
        max_retries = config.dispatch.max_retries,
        request_timeout_secs = config.dispatch.request_timeout_secs,
        "Configuration loaded"
    );
    if config.services.is_empty() {
        tracing::warn!("No services configured, every dispatch will be rejected");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let dispatcher = Dispatcher::from_config(&config, Arc::new(WebSocketConnector::new()));
    let shutdown = Shutdown::new();

    let workers = vec![
        BackgroundWorker::start("health-monitor", &shutdown, {
            let monitor = HealthMonitor::new(
                dispatcher.pool().clone(),
                dispatcher.registry().clone(),
                config.health_check.clone(),
            );
            move |rx| monitor.run(rx)
        }),
        BackgroundWorker::start("idle-sweeper", &shutdown, {
            let sweeper = IdleSweeper::new(dispatcher.pool().clone());
            move |rx| sweeper.run(rx)
        }),
    ];

    tokio::spawn(signals::wait_for_signal(shutdown.clone()));

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let app = setup_admin_router(dispatcher.clone());
        let drain = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain.wait().await })
            .await?;
    } else {
        shutdown.wait().await;
    }

    worker::stop_all(&shutdown, workers, WORKER_STOP_GRACE).await;
    dispatcher.pool().close_idle().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
