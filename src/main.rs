use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;
#[cfg(test)]
mod test_support;

use crate::{services::backup::spawn_daily_backup, state::AppState, storage::StorageRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting linkit with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(
        db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("opening database {}", cfg.database_url))?,
    );
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backends ---
    let registry = Arc::new(
        StorageRegistry::from_settings(&cfg.storage_settings())
            .await
            .context("initialising storage backends")?,
    );
    tracing::info!("Active storage backend: {}", registry.active_platform());

    // --- Initialize core services ---
    let state = AppState::new(
        db.clone(),
        registry.clone(),
        cfg.upload_settings(),
        &cfg.session_cookie,
    );

    let shutdown = CancellationToken::new();
    let backup = spawn_daily_backup(&registry, &cfg.database_url, shutdown.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.chunk_threshold)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = backup {
        if let Err(err) = handle.await {
            tracing::warn!("backup task ended abnormally: {}", err);
        }
    }
    db.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolve on Ctrl-C and tell background tasks to stop.
async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    token.cancel();
}
