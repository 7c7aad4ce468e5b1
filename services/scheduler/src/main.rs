//! quarry scheduler
//!
//! Runs the scheduling core against in-process collaborators and serves the
//! health and debug endpoints. Stores and transports for a real cluster are
//! wired through the library.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use quarry_events::LogRecorder;
use quarry_scheduler::{
    config::Config, node::MemoryNodeStore, store::MemoryPodStore, transport::MockTransport,
    Scheduler,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to QUARRY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting quarry scheduler");
    info!(
        listen_addr = %config.listen_addr,
        initial_backoff_ms = config.scheduler.initial_pod_backoff.as_millis() as u64,
        max_backoff_ms = config.scheduler.max_pod_backoff.as_millis() as u64,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryPodStore::new(config.scheduler.updates_backlog));
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        store,
        Arc::new(MockTransport::new()),
        Arc::new(MemoryNodeStore::new()),
        Arc::new(LogRecorder),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Held open for the lifetime of the process; nothing feeds them in
    // standalone mode.
    let (_offers_tx, offers_rx) = mpsc::channel(config.scheduler.updates_backlog);
    let (_heartbeats_tx, heartbeats_rx) = mpsc::channel(config.scheduler.updates_backlog);

    let handles = scheduler.start(offers_rx, heartbeats_rx, shutdown_rx.clone());

    let app = scheduler.router();
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for components to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in handles {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Component task failed"),
            Err(_) => warn!("Component did not shut down in time"),
        }
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
