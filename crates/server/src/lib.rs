//! Chat Relay Server Library
//!
//! Presence and message coordination for one-to-one chat over WebSocket.

pub mod chat;
pub mod core;

use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::chat::CoordinationEngine;
use crate::core::store::{MemoryStore, SqliteStore};
use crate::core::{AppState, DurableStore, RelayConfig, StorageBackend};

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Already set, ignore
    }

    info!("=== Chat Relay ===");

    let config = RelayConfig::from_env();
    config.ensure_dirs().await?;

    let state = build_state(config.clone()).await?;
    let app = app(state);

    info!("Storage: {:?} ({:?})", config.storage, config.data_dir);
    info!("Admins: {}", config.admin_usernames.join(", "));
    info!("Listening on http://{}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the configured store and build the engine around it.
pub async fn build_state(config: RelayConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn DurableStore> = match config.storage {
        StorageBackend::Sqlite => {
            Arc::new(SqliteStore::open(&config.database_url(), &config.admin_usernames).await?)
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new(&config.admin_usernames)),
    };
    let engine = Arc::new(CoordinationEngine::new(config.clone(), store.clone()));

    Ok(AppState {
        config,
        engine,
        store,
    })
}

/// The full HTTP surface with state applied.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(chat::router())
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK - Chat Relay"
}
