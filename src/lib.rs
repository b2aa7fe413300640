//! # Tabletop Session Server
//!
//! Realtime synchronization server for tabletop game sessions. Players and
//! game masters connect over WebSocket; the server tracks each player's
//! character state and lobby readiness, and periodically fans out aggregate
//! snapshots to connected masters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TABLETOP SESSION SERVER                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  store/          - Persistence boundary                      │
//! │  ├── mod.rs      - Store trait, lobby/character records      │
//! │  └── memory.rs   - In-memory reference backend               │
//! │                                                              │
//! │  network/        - Session handling                          │
//! │  ├── auth.rs     - Credential (JWT) verification             │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── registry.rs - Live connection registry                  │
//! │  ├── engine.rs   - Message dispatch and lobby lifecycle      │
//! │  ├── broadcast.rs- Periodic snapshot fan-out to masters      │
//! │  └── server.rs   - WebSocket accept loop and handshake       │
//! │                                                              │
//! │  config.rs       - Runtime configuration                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Model
//!
//! Connections are keyed by the authenticated user identity: one live
//! session per user, a newer connect supersedes the older one. Lobbies move
//! `waiting -> in_progress -> finished` and never backwards; player
//! readiness moves `connected -> ready -> in_game` driven by lobby
//! transitions. The registry is the source of truth for live session state,
//! the [`store::Store`] for everything that must survive a disconnect.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use config::ServerConfig;
pub use network::{
    AuthConfig, ClientMessage, Engine, PlayerStatus, Registry, Role, ServerMessage, SessionServer,
};
pub use store::{LobbyStatus, MemoryStore, Store};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
