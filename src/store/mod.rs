//! Persistence Layer
//!
//! Durable storage for character and lobby records, exposed to the engine as
//! a small CRUD trait. The engine treats the store as request/response and
//! caches nothing; the bundled [`MemoryStore`] backs the binary and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Lobby lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    /// Created, accepting members, not yet started.
    Waiting,
    /// Game running; members may still join.
    InProgress,
    /// Game over; no further membership changes accepted.
    Finished,
}

impl LobbyStatus {
    /// Whether the lobby accepts membership changes.
    pub fn accepts_members(&self) -> bool {
        matches!(self, LobbyStatus::Waiting | LobbyStatus::InProgress)
    }
}

/// A stored lobby record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyRecord {
    /// Unique lobby identifier.
    pub lobby_id: String,
    /// Identity of the creating master. Immutable.
    pub master_identity: String,
    /// Display label.
    pub name: String,
    /// Current lifecycle status.
    pub status: LobbyStatus,
    /// Ordered, duplicate-free set of member character ids.
    pub member_ids: Vec<String>,
}

impl LobbyRecord {
    /// Whether a character is currently a member.
    pub fn has_member(&self, character_id: &str) -> bool {
        self.member_ids.iter().any(|id| id == character_id)
    }
}

/// A stored character record. The engine never interprets `state` beyond
/// passing it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRecord {
    /// Unique character identifier.
    pub character_id: String,
    /// Identity of the owning user.
    pub owner_identity: String,
    /// Opaque structured state (attributes, inventory, vitals).
    pub state: serde_json::Value,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced lobby does not exist.
    #[error("lobby not found: {0}")]
    LobbyNotFound(String),

    /// Referenced character does not exist.
    #[error("character not found: {0}")]
    CharacterNotFound(String),

    /// Backend failure (I/O, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// CRUD interface the synchronization engine calls.
///
/// Absent records are reported as `Ok(None)` from the getters; the mutating
/// lobby operations return an error when the lobby itself is missing.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a character record.
    async fn get_character(&self, character_id: &str) -> Result<Option<CharacterRecord>, StoreError>;

    /// Save or replace a character's state.
    async fn put_character_state(
        &self,
        character_id: &str,
        state: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// List all characters owned by an identity.
    async fn list_characters_by_owner(
        &self,
        identity: &str,
    ) -> Result<Vec<CharacterRecord>, StoreError>;

    /// Check whether a character belongs to an identity.
    async fn character_owned_by(
        &self,
        character_id: &str,
        identity: &str,
    ) -> Result<bool, StoreError>;

    /// Display name for a user identity.
    async fn username_for_identity(&self, identity: &str) -> Result<Option<String>, StoreError>;

    /// Display name of the user owning a character.
    async fn username_for_character(&self, character_id: &str)
        -> Result<Option<String>, StoreError>;

    /// Create a lobby in `Waiting` with empty membership. Returns the new id.
    async fn create_lobby(&self, master_identity: &str, name: &str) -> Result<String, StoreError>;

    /// Load a lobby record.
    async fn get_lobby(&self, lobby_id: &str) -> Result<Option<LobbyRecord>, StoreError>;

    /// Update a lobby's lifecycle status.
    async fn set_lobby_status(&self, lobby_id: &str, status: LobbyStatus)
        -> Result<(), StoreError>;

    /// Add a character to lobby membership. Returns `false` if already
    /// present (idempotent, not an error).
    async fn add_member(&self, lobby_id: &str, character_id: &str) -> Result<bool, StoreError>;

    /// Remove a character from lobby membership. Returns `false` if absent.
    async fn remove_member(&self, lobby_id: &str, character_id: &str) -> Result<bool, StoreError>;

    /// Clear lobby membership.
    async fn clear_members(&self, lobby_id: &str) -> Result<(), StoreError>;

    /// Delete a lobby record.
    async fn delete_lobby(&self, lobby_id: &str) -> Result<(), StoreError>;
}
