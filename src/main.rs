//! Autopus Bridge - local agent bridge daemon
//!
//! Supervises sandboxed headless browser containers and capability server
//! subprocesses on behalf of a remote controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autopus_bridge::browser::{BackendFactory, BrowserBackend, ChromiumBackend, MockBackend};
use autopus_bridge::config::{Configuration, EngineDriver};
use autopus_bridge::container::{ContainerManager, ContainerPool, PoolConfig};
use autopus_bridge::engine::{CliEngine, ContainerEngine, DockerEngine};
use autopus_bridge::session::SessionManager;
use autopus_bridge::supervisor::{HealthMonitor, ProcessSupervisor};

/// Tick interval of the capability server health reporter
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "autopus-bridge")]
#[command(about = "Local agent bridge for sandboxed browser automation")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("autopus_bridge={}", log_level).into()),
        )
        .init();

    info!("Starting Autopus Bridge v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&cli.config).await {
        error!("Bridge error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config_path: &str) -> Result<()> {
    let config = if std::path::Path::new(config_path).is_file() {
        Configuration::load(config_path)?
    } else {
        warn!("Config file {} not found, using defaults", config_path);
        Configuration::default()
    };

    let engine: Arc<dyn ContainerEngine> = match config.engine.driver {
        EngineDriver::Docker => match &config.engine.socket {
            Some(socket) => Arc::new(DockerEngine::with_socket(socket)?),
            None => Arc::new(DockerEngine::new()?),
        },
        EngineDriver::Cli => Arc::new(CliEngine::new()),
    };

    let manager = ContainerManager::new(engine.clone(), config.container.clone())
        .await
        .context("Container engine is not reachable")?;

    manager.ensure_network().await?;
    manager.ensure_image().await?;

    let pool = Arc::new(ContainerPool::new(
        Arc::new(manager),
        PoolConfig::from_configuration(&config.pool),
    ));

    let factory: BackendFactory = Arc::new(|spec| -> Arc<dyn BrowserBackend> {
        match spec.host_port {
            Some(port) => Arc::new(ChromiumBackend::new(
                port,
                spec.viewport_width,
                spec.viewport_height,
            )),
            None => Arc::new(MockBackend::new()),
        }
    });
    let sessions = Arc::new(SessionManager::new(&config.session, factory));

    let supervisor = Arc::new(ProcessSupervisor::new());
    let health = Arc::new(HealthMonitor::new(supervisor.clone()));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(pool.spawn_replenisher(shutdown.clone()));
    tasks.push(pool.spawn_health_monitor(shutdown.clone()));
    tasks.push(sessions.spawn_cleanup(shutdown.clone()));
    tasks.push(health.start(
        shutdown.clone(),
        HEALTH_REPORT_INTERVAL,
        Arc::new(|report| {
            for server in &report.servers {
                debug!(
                    "Capability server {}: {} ({} calls, {} errors, avg {} ms)",
                    server.name,
                    server.status,
                    server.total_calls,
                    server.error_count,
                    server.avg_response_ms
                );
            }
        }),
    ));

    info!(
        "Bridge ready (pool max {}, warm target {})",
        pool.status().max_count,
        config.pool.warm_pool_size
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Stop background loops first; session cleanup closes all sessions on
    // cancellation.
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }

    sessions.close_all().await;

    if let Err(e) = pool.shutdown().await {
        warn!("Pool shutdown reported errors: {}", e);
    }

    supervisor.stop_all().await;
    health.stop();

    if let Err(e) = engine.close().await {
        warn!("Engine close reported errors: {}", e);
    }

    info!("Bridge stopped");
    Ok(())
}
