use anyhow::Result;
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod identity;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting ephemeral-store with config: {:?}", cfg);

    // --- Ensure content root exists ---
    if !Path::new(&cfg.content_root).exists() {
        fs::create_dir_all(&cfg.content_root)?;
        tracing::info!("Created content root at {}", cfg.content_root);
    }

    // --- Initialize core state ---
    let app_state = state::AppState::new(&cfg.content_root);

    // --- Start the retention sweeper ---
    let sweeper = services::sweeper::spawn(
        app_state.store.clone(),
        app_state.sessions.clone(),
        app_state.abuse.clone(),
    );

    // --- Build router ---
    let sessions = app_state.sessions.clone();
    let app = routes::routes::routes().with_state(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Drain in-flight uploads and stop the sweeper ---
    let active = sessions.active();
    if active > 0 {
        tracing::info!("cancelling {} in-flight upload sessions", active);
    }
    sessions.drain();
    sweeper.abort();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
    }
}
