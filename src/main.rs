//! Indicator scheduler - runs due indicators, evaluates thresholds, raises alerts

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use indicator_scheduler::buffer::EventOutbox;
use indicator_scheduler::config::{Config, LogFormat};
use indicator_scheduler::db::Database;
use indicator_scheduler::metrics::SchedulerMetrics;
use indicator_scheduler::routes;
use indicator_scheduler::services::orchestrator::ExecutionOrchestrator;
use indicator_scheduler::state::AppState;
use indicator_scheduler::tasks::{dispatch, reaper, scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "indicator_scheduler=info,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    // Connect to database
    let db = Arc::new(
        Database::new(&config.database_url, &config.data_source_function)
            .await
            .context("Failed to connect to database")?,
    );
    if config.run_migrations {
        db.migrate().await.context("Failed to apply migrations")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let outbox = EventOutbox::new(config.outbox_capacity);
    let metrics = Arc::new(SchedulerMetrics::new());

    let orchestrator = ExecutionOrchestrator::new(
        db.clone(),
        db.clone(),
        db.clone(),
        db.clone(),
        outbox.clone(),
        metrics.clone(),
        config.orchestrator(),
        shutdown_rx.clone(),
    );

    // Create application state
    let state = AppState::new(
        orchestrator.clone(),
        outbox.clone(),
        metrics.clone(),
        config.broadcast_capacity,
    );

    // Spawn background tasks
    // 1. Scheduler - one tick per interval
    let scheduler_handle = tokio::spawn(scheduler::scheduler_task(
        orchestrator.clone(),
        config.tick_interval,
        shutdown_rx.clone(),
    ));

    // 2. Reaper - releases stale running flags
    let reaper_handle = tokio::spawn(reaper::reaper_task(
        orchestrator.guard().clone(),
        config.stale_run_policy.clone(),
        config.reaper_interval,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    // 3. Dispatch - alerts to the notifier, events to WebSocket clients
    let dispatch_handle = tokio::spawn(dispatch::dispatch_task(
        outbox,
        db.clone(),
        state.broadcast_tx.clone(),
        metrics,
        shutdown_rx.clone(),
    ));

    let app = routes::router(state);

    info!(
        "Indicator scheduler v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));
    info!(
        tick_secs = config.tick_interval.as_secs(),
        batch_size = config.batch_size,
        max_parallel = config.max_parallel_executions,
        fetch_timeout_secs = config.fetch_timeout.as_secs(),
        "Scheduler configured"
    );

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stopping| *stopping).await;
    });
    let server_handle = tokio::spawn(async move { server.await });

    shutdown_signal().await;
    info!("Shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [
        ("scheduler", scheduler_handle),
        ("reaper", reaper_handle),
        ("dispatch", dispatch_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
    server_handle
        .await
        .context("Server task panicked")?
        .context("Server error")?;

    info!("Indicator scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
