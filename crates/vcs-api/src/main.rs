//! Video compressor service binary.
//!
//! Runs the MMP gateway, the dispatcher and the expiry sweeper in one process
//! around a shared in-memory job registry.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vcs_api::{metrics, ApiConfig, AppState, ExpirySweeper, Server};
use vcs_media::{check_ffmpeg, FfmpegExecutor, MediaExecutor};
use vcs_queue::{JobRegistry, QueueConfig, ResourceGovernor};
use vcs_storage::{LedgerConfig, StorageLedger, Workspace};
use vcs_worker::{Dispatcher, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = match "vcs=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vcs-api");

    let api_config = ApiConfig::from_env();
    let ledger_config = LedgerConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    info!(
        "Config: bind={}, storage_capacity={} bytes, cpu_ceiling={}, max_concurrent_jobs={}, work_dir={}",
        api_config.bind_addr(),
        ledger_config.capacity_bytes,
        queue_config.governor.cpu_ceiling,
        queue_config.governor.max_concurrent_jobs,
        worker_config.work_dir.display()
    );

    if let Some(addr) = api_config.metrics_addr {
        match metrics::init_metrics(addr) {
            Ok(()) => info!("Prometheus metrics exported on {}", addr),
            Err(e) => warn!("Failed to start metrics exporter: {:#}", e),
        }
    }

    if let Err(e) = check_ffmpeg() {
        warn!("{}; jobs will fail until FFmpeg is installed", e);
    }

    let mut workspace = Workspace::new(&worker_config.work_dir);
    if let Some(root) = &api_config.media_root {
        info!("Server-side sources enabled below {}", root.display());
        workspace = workspace.with_source_root(root);
    }
    if let Err(e) = workspace.init().await {
        error!("Failed to initialize workspace: {}", e);
        std::process::exit(1);
    }
    match workspace.purge_stale_uploads().await {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} stale uploads", removed),
        Err(e) => warn!("Failed to remove stale uploads: {}", e),
    }

    let registry = Arc::new(JobRegistry::new(
        queue_config.registry,
        Arc::new(StorageLedger::new(ledger_config)),
        Arc::new(ResourceGovernor::new(queue_config.governor)),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Dispatcher
    let executor: Arc<dyn MediaExecutor> = Arc::new(FfmpegExecutor::new());
    let dispatcher = Arc::new(Dispatcher::new(
        worker_config,
        Arc::clone(&registry),
        executor,
        workspace.clone(),
    ));
    let dispatcher_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run().await {
                error!("Dispatcher error: {}", e);
            }
        })
    };

    // Expiry sweeper
    let sweeper = ExpirySweeper::new(
        Arc::clone(&registry),
        workspace.clone(),
        api_config.sweep_interval,
    );
    let sweeper_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    // Gateway
    let bind_addr = api_config.bind_addr();
    let state = AppState::new(api_config, Arc::clone(&registry), workspace);
    let server = match Server::bind(&bind_addr, state).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };
    let server_task = tokio::spawn(server.run(shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    dispatcher.shutdown();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Gateway error: {}", e),
        Err(e) => error!("Gateway task failed: {}", e),
    }
    let _ = sweeper_task.await;
    let _ = dispatcher_task.await;

    info!("Server shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
