//! Tabletop Session Server
//!
//! Realtime synchronization server for tabletop game sessions.
//! Accepts player and master WebSocket connections, tracks character state
//! and lobby readiness, and broadcasts aggregate snapshots to masters.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabletop_session::{
    config::ServerConfig,
    network::{AuthConfig, SessionServer},
    store::{MemoryStore, Store},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Tabletop Session Server v{}", VERSION);

    let config = ServerConfig::from_env();
    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("AUTH_SECRET not set - every connection will be rejected");
    }
    info!(
        bind_addr = %config.bind_addr,
        max_connections = config.max_connections,
        broadcast_period_secs = config.broadcast_period.as_secs(),
        "configuration loaded"
    );

    let store = Arc::new(MemoryStore::new()) as Arc<dyn Store>;
    let server = Arc::new(SessionServer::new(config, auth, store));

    let shutdown_handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown_handle.shutdown();
        }
    });

    server.run().await.context("server terminated")?;
    info!("goodbye");
    Ok(())
}
