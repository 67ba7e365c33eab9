mod app;
mod auth;
mod config;
mod error;
mod health;
mod log_ring;
mod network;
mod routes_models;
mod routes_runtime;
mod routes_system;
mod runtime;
mod state;
mod stats;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::from_env()?;
    let launcher = cfg.load_launcher_config()?;
    let addr = cfg.bind_addr_for(&launcher);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let port = listener.local_addr().context("listener has no local address")?.port();

    let state = Arc::new(AppState::new(launcher, &cfg.nvidia_smi, port));
    banner(&state).await;

    let app = app::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // don't leave llama-server orphaned holding the GPU
    match state.supervisor.stop().await {
        Ok(s) if s.stopped.is_some() => info!(model = ?s.stopped, "stopped model on shutdown"),
        Ok(_) => {}
        Err(e) => warn!("stop on shutdown failed: {e}"),
    }
    Ok(())
}

async fn banner(state: &AppState) {
    let net = network::discover(state.port, Duration::from_secs(3)).await;
    info!(
        "llm launcher {} on port {} ({} models configured)",
        env!("CARGO_PKG_VERSION"),
        state.port,
        state.config.models.len()
    );
    for url in &net.urls {
        info!("  {url}");
    }
    info!("  API key: {}", state.auth.hint());
    info!(
        "  llama-server: {} -> {}:{}",
        state.config.paths.llama_server.display(),
        state.config.server.llama_host,
        state.config.server.llama_port
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
