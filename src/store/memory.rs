//! In-Memory Store
//!
//! `BTreeMap`-backed implementation of [`Store`]. Used by the binary as the
//! default backend and by the engine tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CharacterRecord, LobbyRecord, LobbyStatus, Store, StoreError};

#[derive(Default)]
struct Tables {
    /// identity -> username
    users: BTreeMap<String, String>,
    characters: BTreeMap<String, CharacterRecord>,
    lobbies: BTreeMap<String, LobbyRecord>,
}

/// In-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user identity with a display name.
    pub async fn insert_user(&self, identity: &str, username: &str) {
        let mut tables = self.tables.write().await;
        tables.users.insert(identity.to_string(), username.to_string());
    }

    /// Insert a character record, replacing any prior one with the same id.
    pub async fn insert_character(&self, record: CharacterRecord) {
        let mut tables = self.tables.write().await;
        tables.characters.insert(record.character_id.clone(), record);
    }

    /// Create a character owned by `identity` with a fresh id.
    pub async fn create_character(
        &self,
        identity: &str,
        state: serde_json::Value,
    ) -> String {
        let character_id = uuid::Uuid::new_v4().to_string();
        self.insert_character(CharacterRecord {
            character_id: character_id.clone(),
            owner_identity: identity.to_string(),
            state,
        })
        .await;
        character_id
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_character(&self, character_id: &str) -> Result<Option<CharacterRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.characters.get(character_id).cloned())
    }

    async fn put_character_state(
        &self,
        character_id: &str,
        state: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.characters.get_mut(character_id) {
            Some(record) => {
                record.state = state;
                Ok(())
            }
            None => Err(StoreError::CharacterNotFound(character_id.to_string())),
        }
    }

    async fn list_characters_by_owner(
        &self,
        identity: &str,
    ) -> Result<Vec<CharacterRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .characters
            .values()
            .filter(|c| c.owner_identity == identity)
            .cloned()
            .collect())
    }

    async fn character_owned_by(
        &self,
        character_id: &str,
        identity: &str,
    ) -> Result<bool, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .characters
            .get(character_id)
            .map(|c| c.owner_identity == identity)
            .unwrap_or(false))
    }

    async fn username_for_identity(&self, identity: &str) -> Result<Option<String>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(identity).cloned())
    }

    async fn username_for_character(
        &self,
        character_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let tables = self.tables.read().await;
        let owner = match tables.characters.get(character_id) {
            Some(c) => &c.owner_identity,
            None => return Ok(None),
        };
        Ok(tables.users.get(owner).cloned())
    }

    async fn create_lobby(&self, master_identity: &str, name: &str) -> Result<String, StoreError> {
        let lobby_id = uuid::Uuid::new_v4().to_string();
        let mut tables = self.tables.write().await;
        tables.lobbies.insert(
            lobby_id.clone(),
            LobbyRecord {
                lobby_id: lobby_id.clone(),
                master_identity: master_identity.to_string(),
                name: name.to_string(),
                status: LobbyStatus::Waiting,
                member_ids: Vec::new(),
            },
        );
        Ok(lobby_id)
    }

    async fn get_lobby(&self, lobby_id: &str) -> Result<Option<LobbyRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.lobbies.get(lobby_id).cloned())
    }

    async fn set_lobby_status(
        &self,
        lobby_id: &str,
        status: LobbyStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.lobbies.get_mut(lobby_id) {
            Some(lobby) => {
                lobby.status = status;
                Ok(())
            }
            None => Err(StoreError::LobbyNotFound(lobby_id.to_string())),
        }
    }

    async fn add_member(&self, lobby_id: &str, character_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.lobbies.get_mut(lobby_id) {
            Some(lobby) => {
                if lobby.has_member(character_id) {
                    Ok(false)
                } else {
                    lobby.member_ids.push(character_id.to_string());
                    Ok(true)
                }
            }
            None => Err(StoreError::LobbyNotFound(lobby_id.to_string())),
        }
    }

    async fn remove_member(&self, lobby_id: &str, character_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.lobbies.get_mut(lobby_id) {
            Some(lobby) => {
                let before = lobby.member_ids.len();
                lobby.member_ids.retain(|id| id != character_id);
                Ok(lobby.member_ids.len() != before)
            }
            None => Err(StoreError::LobbyNotFound(lobby_id.to_string())),
        }
    }

    async fn clear_members(&self, lobby_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.lobbies.get_mut(lobby_id) {
            Some(lobby) => {
                lobby.member_ids.clear();
                Ok(())
            }
            None => Err(StoreError::LobbyNotFound(lobby_id.to_string())),
        }
    }

    async fn delete_lobby(&self, lobby_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.lobbies.remove(lobby_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_character_crud() {
        let store = MemoryStore::new();
        store.insert_user("u1", "alice").await;
        let char_id = store.create_character("u1", json!({"hp": 10})).await;

        let record = store.get_character(&char_id).await.unwrap().unwrap();
        assert_eq!(record.owner_identity, "u1");
        assert_eq!(record.state["hp"], 10);

        store
            .put_character_state(&char_id, json!({"hp": 7}))
            .await
            .unwrap();
        let record = store.get_character(&char_id).await.unwrap().unwrap();
        assert_eq!(record.state["hp"], 7);

        assert!(store.character_owned_by(&char_id, "u1").await.unwrap());
        assert!(!store.character_owned_by(&char_id, "u2").await.unwrap());

        let owned = store.list_characters_by_owner("u1").await.unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn test_put_unknown_character_fails() {
        let store = MemoryStore::new();
        let result = store.put_character_state("missing", json!({})).await;
        assert!(matches!(result, Err(StoreError::CharacterNotFound(_))));
    }

    #[tokio::test]
    async fn test_username_lookup() {
        let store = MemoryStore::new();
        store.insert_user("u1", "alice").await;
        let char_id = store.create_character("u1", json!({})).await;

        assert_eq!(
            store.username_for_identity("u1").await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(
            store
                .username_for_character(&char_id)
                .await
                .unwrap()
                .as_deref(),
            Some("alice")
        );
        assert!(store
            .username_for_character("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lobby_lifecycle() {
        let store = MemoryStore::new();
        let lobby_id = store.create_lobby("master", "Dungeon").await.unwrap();

        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert_eq!(lobby.status, LobbyStatus::Waiting);
        assert!(lobby.member_ids.is_empty());

        store
            .set_lobby_status(&lobby_id, LobbyStatus::InProgress)
            .await
            .unwrap();
        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert_eq!(lobby.status, LobbyStatus::InProgress);

        store.delete_lobby(&lobby_id).await.unwrap();
        assert!(store.get_lobby(&lobby_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_membership_is_idempotent() {
        let store = MemoryStore::new();
        let lobby_id = store.create_lobby("master", "Dungeon").await.unwrap();

        assert!(store.add_member(&lobby_id, "c1").await.unwrap());
        assert!(!store.add_member(&lobby_id, "c1").await.unwrap());
        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert_eq!(lobby.member_ids, vec!["c1".to_string()]);

        assert!(store.remove_member(&lobby_id, "c1").await.unwrap());
        assert!(!store.remove_member(&lobby_id, "c1").await.unwrap());
        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert!(lobby.member_ids.is_empty());
    }

    #[tokio::test]
    async fn test_membership_preserves_order() {
        let store = MemoryStore::new();
        let lobby_id = store.create_lobby("master", "Dungeon").await.unwrap();

        store.add_member(&lobby_id, "c2").await.unwrap();
        store.add_member(&lobby_id, "c1").await.unwrap();
        store.add_member(&lobby_id, "c3").await.unwrap();

        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert_eq!(lobby.member_ids, vec!["c2", "c1", "c3"]);
    }

    #[tokio::test]
    async fn test_clear_members() {
        let store = MemoryStore::new();
        let lobby_id = store.create_lobby("master", "Dungeon").await.unwrap();
        store.add_member(&lobby_id, "c1").await.unwrap();
        store.add_member(&lobby_id, "c2").await.unwrap();

        store.clear_members(&lobby_id).await.unwrap();
        let lobby = store.get_lobby(&lobby_id).await.unwrap().unwrap();
        assert!(lobby.member_ids.is_empty());
    }

    #[tokio::test]
    async fn test_member_ops_on_missing_lobby() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_member("missing", "c1").await,
            Err(StoreError::LobbyNotFound(_))
        ));
        assert!(matches!(
            store.remove_member("missing", "c1").await,
            Err(StoreError::LobbyNotFound(_))
        ));
    }
}
