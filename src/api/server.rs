use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{info, warn};

use super::{
    services::{cancel_job, get_job, health, stats, submit_job},
    state::AppState,
};
use crate::config::Config;
use crate::notify::sink_from_config;
use crate::observability::Metrics;
use crate::queue::QueueManager;
use crate::worker::{ShutdownMode, WorkerContext, WorkerPool};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Routes of the chat-transport facing API
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .with_state(state)
        // Transparently decompress gzip request bodies
        .layer(RequestDecompressionLayer::new())
}

/// Run the queue, the worker pool and the HTTP API until a shutdown signal,
/// then drain outstanding jobs
pub async fn run(config: Config) -> Result<(), AnyError> {
    let metrics = Arc::new(Metrics::new());
    let sink = sink_from_config(&config.notify)
        .map_err(|e| format!("Failed to build notification sink: {}", e))?;
    let manager = QueueManager::new(config.queue.clone(), sink, metrics);

    let context = WorkerContext::from_config(&config)
        .map_err(|e| format!("Failed to set up workers: {}", e))?;
    if let Some(cache) = context.cache() {
        match cache.prune_expired() {
            Ok(stats) => info!(pruned = stats.total(), "Artifact cache ready"),
            Err(e) => warn!(error = %e, "Artifact cache pruning failed"),
        }
    }

    let pool = WorkerPool::spawn(&manager, context);
    let janitor = manager.spawn_janitor(JANITOR_INTERVAL);

    let address = config.server.bind_addr;
    let app = router(AppState::new(config, manager));

    let listener = TcpListener::bind(address).await?;
    info!(%address, "mediafix API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    janitor.abort();
    pool.shutdown(ShutdownMode::Drain).await;

    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
