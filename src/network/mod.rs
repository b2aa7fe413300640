//! Network Layer
//!
//! WebSocket transport, credential verification, the connection registry,
//! the message dispatcher, and the periodic snapshot broadcaster.

pub mod auth;
pub mod broadcast;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::{verify_credential, AuthConfig, AuthError, TokenClaims};
pub use broadcast::{broadcast_once, collect_snapshot, Broadcaster};
pub use engine::{Engine, EngineError};
pub use protocol::{ClientMessage, PlayerSnapshot, PlayerStatus, Role, ServerMessage};
pub use registry::{Connection, Registry};
pub use server::{ServerError, SessionServer};
