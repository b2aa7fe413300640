//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Default broadcast period for master snapshots.
pub const DEFAULT_BROADCAST_PERIOD: Duration = Duration::from_secs(3);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent registered connections.
    pub max_connections: usize,
    /// Period between master snapshot broadcasts.
    pub broadcast_period: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 1000,
            broadcast_period: DEFAULT_BROADCAST_PERIOD,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Build configuration from environment variables, falling back to the
    /// defaults on missing or unparseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(_) => warn!(addr, "ignoring unparseable BIND_ADDR"),
            }
        }
        if let Ok(n) = std::env::var("MAX_CONNECTIONS") {
            match n.parse() {
                Ok(n) => config.max_connections = n,
                Err(_) => warn!(n, "ignoring unparseable MAX_CONNECTIONS"),
            }
        }
        if let Ok(secs) = std::env::var("BROADCAST_PERIOD_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => config.broadcast_period = Duration::from_secs(secs),
                Err(_) => warn!(secs, "ignoring unparseable BROADCAST_PERIOD_SECS"),
            }
        }
        config
    }
}
