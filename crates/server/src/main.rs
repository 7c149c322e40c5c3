mod api;
mod bootstrap;
mod evaluator;
mod health;
mod metrics;
mod scheduler;

use std::future::IntoFuture;

use anyhow::Result;
use vigil_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use vigil_core::config::LogFormat::*;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let scheduler_handle = scheduler::spawn(
        &app.config.scheduler,
        app.leases.clone(),
        app.evaluator.clone(),
        app.dispatcher.clone(),
        app.instance_id.clone(),
    );

    let router = api::router(app.api_state.clone()).merge(health::router(app.db_pool.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        instance_id = %app.instance_id,
        "vigil-server listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(());
            })
            .into_future(),
    );

    // Run until the shutdown signal fires, then bound the drain window.
    let _ = shutdown_rx.await;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "vigil-server stopping"
    );

    let drain = std::time::Duration::from_secs(app.config.server.graceful_shutdown_secs.max(1));
    if tokio::time::timeout(drain, server).await.is_err() {
        tracing::warn!(
            event_name = "system.server.drain_timeout",
            correlation_id = "shutdown",
            "graceful drain window elapsed before all connections closed"
        );
    }

    scheduler_handle.shutdown();
    app.db_pool.close().await;

    Ok(())
}
