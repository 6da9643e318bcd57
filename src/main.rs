use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zgate::config::AppConfig;
use zgate::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::fs::create_dir_all(&config.data_dir)?;

    let state = AppState::new(config);
    let cancel = CancellationToken::new();

    if let Err(e) = state.pool.reload() {
        warn!("initial credential load failed: {}", e);
    }
    // watcher handle must stay alive for hot reload to keep working
    let _watcher = state.pool.spawn_watcher();
    state
        .pool
        .spawn_validator(state.upstream.clone(), cancel.clone());
    state.fe_version.spawn_refresher(
        state.upstream.http().clone(),
        state.config.upstream_base.clone(),
        cancel.clone(),
    );
    state
        .registry
        .spawn_fetcher(state.upstream.clone(), cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!(
        "zgate v{} starting on port {}",
        env!("CARGO_PKG_VERSION"),
        state.config.port
    );
    server::serve(Arc::clone(&state), cancel).await
}
