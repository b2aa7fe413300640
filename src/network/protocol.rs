//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are serialized as JSON, tagged by a `type` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::LobbyStatus;

/// Connection role, declared at connect time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Bound to exactly one selected character for the session.
    Player,
    /// Creates and controls lobbies; observes aggregated player state.
    Master,
}

/// Per-connection player readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// No lobby affiliation.
    Connected,
    /// Affiliated with a lobby, awaiting start.
    Ready,
    /// Lobby is in progress.
    InGame,
}

impl PlayerStatus {
    /// Whether this player belongs in master snapshots.
    pub fn is_active(&self) -> bool {
        matches!(self, PlayerStatus::Ready | PlayerStatus::InGame)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and register. Must be the first message on a connection.
    Connect {
        /// Opaque credential token.
        credential: String,
        /// Declared role.
        role: Role,
        /// Selected character (players only).
        #[serde(default)]
        character_id: Option<String>,
        /// Lobby to re-enter mid-game (players only).
        #[serde(default)]
        lobby_id: Option<String>,
    },

    /// Push the player's character state.
    CharacterUpdate {
        /// Declared character id; must match the connection's selection.
        character_id: String,
        /// Opaque character state.
        state: serde_json::Value,
    },

    /// Mark ready for a lobby's game.
    JoinLobby {
        /// Target lobby.
        lobby_id: String,
    },

    /// Withdraw readiness from the current lobby.
    LeaveLobby,

    /// Create a lobby (masters only).
    CreateLobby {
        /// Display label for the lobby.
        name: String,
    },

    /// Start a lobby's game (owning master only).
    StartLobby {
        /// Target lobby.
        lobby_id: String,
    },

    /// End a running game (owning master only).
    EndLobby {
        /// Target lobby.
        lobby_id: String,
    },

    /// Delete a waiting lobby (owning master only).
    DeleteLobby {
        /// Target lobby.
        lobby_id: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// One player's entry in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Opaque character state.
    pub state: serde_json::Value,
    /// Readiness status.
    pub status: PlayerStatus,
    /// Display name of the owning user.
    pub username: String,
    /// Affiliated lobby, if any.
    pub lobby_id: Option<String>,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Aggregate state of all active players, keyed by character id.
    PlayersSnapshot {
        /// Snapshot entries.
        players: BTreeMap<String, PlayerSnapshot>,
    },

    /// A single character's state changed.
    CharacterUpdate {
        /// Character identifier.
        character_id: String,
        /// Opaque character state.
        state: serde_json::Value,
    },

    /// Lobby created.
    LobbyCreated {
        /// New lobby identifier.
        lobby_id: String,
        /// Display label.
        name: String,
    },

    /// The lobby's game has started.
    GameStarted {
        /// Lobby identifier.
        lobby_id: String,
    },

    /// The lobby's game has ended.
    GameEnded {
        /// Human-readable reason.
        message: String,
    },

    /// The lobby was deleted.
    LobbyDeleted {
        /// Human-readable reason.
        message: String,
    },

    /// Readiness acknowledged.
    JoinAck {
        /// Human-readable confirmation.
        message: String,
    },

    /// Readiness withdrawn.
    LeaveAck {
        /// Human-readable confirmation.
        message: String,
    },

    /// A request was rejected; the connection stays open.
    Error {
        /// Human-readable reason.
        message: String,
    },

    /// The connection is being terminated; client should navigate elsewhere.
    Redirect {
        /// Navigation target.
        target: String,
        /// Human-readable reason.
        message: String,
    },
}

impl From<LobbyStatus> for PlayerStatus {
    /// Readiness implied by the affiliated lobby's status when (re)joining.
    fn from(status: LobbyStatus) -> Self {
        match status {
            LobbyStatus::InProgress => PlayerStatus::InGame,
            _ => PlayerStatus::Ready,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_message_json() {
        let json_text = r#"{
            "type": "connect",
            "credential": "tok",
            "role": "player",
            "character_id": "c1"
        }"#;

        let msg = ClientMessage::from_json(json_text).unwrap();
        match msg {
            ClientMessage::Connect {
                credential,
                role,
                character_id,
                lobby_id,
            } => {
                assert_eq!(credential, "tok");
                assert_eq!(role, Role::Player);
                assert_eq!(character_id.as_deref(), Some("c1"));
                assert!(lobby_id.is_none());
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::JoinLobby {
            lobby_id: "l1".into(),
        };
        let json_text = msg.to_json().unwrap();
        assert!(json_text.contains(r#""type":"join_lobby""#));

        let msg = ClientMessage::LeaveLobby;
        let json_text = msg.to_json().unwrap();
        assert!(json_text.contains(r#""type":"leave_lobby""#));

        let msg = ClientMessage::CharacterUpdate {
            character_id: "c1".into(),
            state: json!({"hp": 3}),
        };
        let json_text = msg.to_json().unwrap();
        assert!(json_text.contains(r#""type":"character_update""#));
    }

    #[test]
    fn test_server_message_roundtrip() {
        let mut players = BTreeMap::new();
        players.insert(
            "c1".to_string(),
            PlayerSnapshot {
                state: json!({"hp": 12}),
                status: PlayerStatus::Ready,
                username: "alice".into(),
                lobby_id: Some("l1".into()),
            },
        );

        let msg = ServerMessage::PlayersSnapshot { players };
        let json_text = msg.to_json().unwrap();
        assert!(json_text.contains(r#""type":"players_snapshot""#));
        assert!(json_text.contains(r#""status":"ready""#));

        let parsed = ServerMessage::from_json(&json_text).unwrap();
        match parsed {
            ServerMessage::PlayersSnapshot { players } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players["c1"].username, "alice");
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_status_from_lobby_status() {
        assert_eq!(
            PlayerStatus::from(LobbyStatus::Waiting),
            PlayerStatus::Ready
        );
        assert_eq!(
            PlayerStatus::from(LobbyStatus::InProgress),
            PlayerStatus::InGame
        );
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(ClientMessage::from_json("{\"type\":\"unknown_kind\"}").is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_redirect_message() {
        let msg = ServerMessage::Redirect {
            target: "/player".into(),
            message: "invalid character selection".into(),
        };
        let json_text = msg.to_json().unwrap();
        assert!(json_text.contains(r#""type":"redirect""#));
        assert!(json_text.contains(r#""target":"/player""#));
    }
}
