pub mod attachments;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ids;
pub mod models;
pub mod query;
pub mod sanitize;
pub mod session;
pub mod store;
pub mod tracker;
pub mod web;

use crate::config::TrackerConfig;
use crate::session::SingleUserSession;
use crate::tracker::TaskTracker;
use crate::web::AppState;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub async fn run() -> anyhow::Result<()> {
    let config = TrackerConfig::load().context("failed to load configuration")?;
    init_tracing(&config.log_dir()).map_err(anyhow::Error::msg)?;

    let tracker = Arc::new(TaskTracker::from_config(&config));
    let session = Arc::new(SingleUserSession::new());
    let app = web::router(AppState::new(tracker, session, &config));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        data_dir = %config.data_dir.to_string_lossy(),
        "taskflow listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;
    tracing::info!("taskflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "taskflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
