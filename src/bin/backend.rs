use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tubeproxy::api::{AppState, router};
use tubeproxy::config;
use tubeproxy::provider::InnertubeProvider;
use tubeproxy::security::ensure_not_root;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    ensure_not_root("tubeproxy-backend")?;

    let cfg = config::load_runtime_config()?;
    let state = AppState::new(Arc::new(InnertubeProvider::new()));
    let app = router(state);

    let addr = SocketAddr::new(cfg.host.parse().context("parsing listen host")?, cfg.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("download proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running download proxy")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}
