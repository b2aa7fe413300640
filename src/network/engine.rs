//! Synchronization Engine
//!
//! The message dispatcher and the lobby / player-readiness state machines.
//! Every inbound message is validated (shape, role, ownership), applied as a
//! single state transition, persisted where the transition touches durable
//! state, and answered with zero or more outbound messages.
//!
//! All cross-connection mutations (a lobby start forcing another player's
//! status) go through [`Registry::update`], never through another task's
//! local state.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::network::protocol::{ClientMessage, PlayerStatus, Role, ServerMessage};
use crate::network::registry::{Connection, Registry};
use crate::store::{LobbyRecord, LobbyStatus, Store, StoreError};

/// Engine errors. All variants are validation failures reported back to the
/// requesting connection; none of them terminate it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Valid identity, wrong ownership or role.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Transition attempted from a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Referenced lobby or character is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence collaborator failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The realtime synchronization engine.
///
/// Constructed once at process start and shared by every connection task and
/// the broadcaster.
pub struct Engine {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
}

impl Engine {
    /// Create an engine over a registry and a persistence collaborator.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The persistence collaborator.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Dispatch one inbound message and answer validation failures with a
    /// targeted `error` reply. Never terminates the connection.
    pub async fn handle_message(&self, identity: &str, msg: ClientMessage) {
        if let Err(e) = self.dispatch(identity, msg).await {
            debug!(identity, error = %e, "message rejected");
            self.send_to(identity, ServerMessage::Error { message: e.to_string() })
                .await;
        }
    }

    /// Dispatch one inbound message by kind and the connection's role.
    pub async fn dispatch(&self, identity: &str, msg: ClientMessage) -> Result<(), EngineError> {
        match msg {
            ClientMessage::Connect { .. } => Err(EngineError::InvalidState(
                "connection is already established".into(),
            )),
            ClientMessage::CharacterUpdate {
                character_id,
                state,
            } => self.character_update(identity, &character_id, state).await,
            ClientMessage::JoinLobby { lobby_id } => self.join_lobby(identity, &lobby_id).await,
            ClientMessage::LeaveLobby => self.leave_lobby(identity).await,
            ClientMessage::CreateLobby { name } => self.create_lobby(identity, &name).await,
            ClientMessage::StartLobby { lobby_id } => self.start_lobby(identity, &lobby_id).await,
            ClientMessage::EndLobby { lobby_id } => self.end_lobby(identity, &lobby_id).await,
            ClientMessage::DeleteLobby { lobby_id } => {
                self.delete_lobby(identity, &lobby_id).await
            }
        }
    }

    // =========================================================================
    // PLAYER OPERATIONS
    // =========================================================================

    /// Persist a player's character state and forward it to every master.
    async fn character_update(
        &self,
        identity: &str,
        character_id: &str,
        state: serde_json::Value,
    ) -> Result<(), EngineError> {
        let conn = self.player_connection(identity).await?;
        let selected = self.selected_character(&conn)?;

        if character_id != selected {
            return Err(EngineError::Authorization(
                "character id does not match this connection's selection".into(),
            ));
        }
        if !self.store.character_owned_by(selected, identity).await? {
            return Err(EngineError::Authorization(
                "character does not belong to this user".into(),
            ));
        }

        self.store
            .put_character_state(selected, state.clone())
            .await?;
        debug!(identity, character_id = selected, "character state updated");

        // Push the single change to masters without waiting for the next
        // broadcast tick.
        let update = ServerMessage::CharacterUpdate {
            character_id: selected.to_string(),
            state,
        };
        for master in self.registry.master_identities().await {
            self.send_to(&master, update.clone()).await;
        }
        Ok(())
    }

    /// `connected -> ready` (and straight on to `in_game` when the lobby is
    /// already running).
    async fn join_lobby(&self, identity: &str, lobby_id: &str) -> Result<(), EngineError> {
        let conn = self.player_connection(identity).await?;
        let character_id = self.selected_character(&conn)?.to_string();

        let lobby = self.require_lobby(lobby_id).await?;
        if !lobby.status.accepts_members() {
            return Err(EngineError::InvalidState(
                "lobby is not open for joining".into(),
            ));
        }

        self.registry
            .update(identity, |c| {
                c.status = PlayerStatus::Ready;
                c.lobby_id = Some(lobby_id.to_string());
            })
            .await;
        self.store.add_member(lobby_id, &character_id).await?;
        info!(identity, lobby_id, "player ready");

        self.send_to(
            identity,
            ServerMessage::JoinAck {
                message: format!("ready in lobby {}", lobby.name),
            },
        )
        .await;

        // Joining a running game skips the waiting room.
        if lobby.status == LobbyStatus::InProgress {
            self.registry
                .update(identity, |c| c.status = PlayerStatus::InGame)
                .await;
            self.send_to(
                identity,
                ServerMessage::GameStarted {
                    lobby_id: lobby_id.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    /// `ready -> connected`; only while the lobby is still waiting.
    async fn leave_lobby(&self, identity: &str) -> Result<(), EngineError> {
        let conn = self.player_connection(identity).await?;
        let character_id = self.selected_character(&conn)?.to_string();
        let lobby_id = conn
            .lobby_id
            .clone()
            .ok_or_else(|| EngineError::InvalidState("not in a lobby".into()))?;

        let lobby = self.require_lobby(&lobby_id).await?;
        if lobby.status != LobbyStatus::Waiting {
            return Err(EngineError::InvalidState(
                "the game has already started".into(),
            ));
        }

        self.registry
            .update(identity, |c| {
                c.status = PlayerStatus::Connected;
                c.lobby_id = None;
            })
            .await;
        self.store.remove_member(&lobby_id, &character_id).await?;
        info!(identity, lobby_id, "player no longer ready");

        self.send_to(
            identity,
            ServerMessage::LeaveAck {
                message: "no longer ready".into(),
            },
        )
        .await;
        Ok(())
    }

    // =========================================================================
    // MASTER OPERATIONS
    // =========================================================================

    /// Create a lobby in `waiting` with empty membership.
    async fn create_lobby(&self, identity: &str, name: &str) -> Result<(), EngineError> {
        self.master_connection(identity).await?;

        let lobby_id = self.store.create_lobby(identity, name).await?;
        info!(identity, lobby_id, name, "lobby created");

        self.send_to(
            identity,
            ServerMessage::LobbyCreated {
                lobby_id,
                name: name.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// `waiting -> in_progress`; forces every affiliated member connection to
    /// `in_game` and notifies it.
    async fn start_lobby(&self, identity: &str, lobby_id: &str) -> Result<(), EngineError> {
        self.master_connection(identity).await?;
        let lobby = self.owned_lobby(identity, lobby_id).await?;
        if lobby.status != LobbyStatus::Waiting {
            return Err(EngineError::InvalidState("lobby is not waiting".into()));
        }

        self.store
            .set_lobby_status(lobby_id, LobbyStatus::InProgress)
            .await?;
        info!(identity, lobby_id, "game started");

        let started = ServerMessage::GameStarted {
            lobby_id: lobby_id.to_string(),
        };
        for player in self.registry.player_identities().await {
            let Some(conn) = self.registry.get(&player).await else {
                continue;
            };
            let is_member = conn
                .character_id
                .as_deref()
                .map(|c| lobby.has_member(c))
                .unwrap_or(false);
            if conn.lobby_id.as_deref() == Some(lobby_id) && is_member {
                self.registry
                    .update(&player, |c| c.status = PlayerStatus::InGame)
                    .await;
                self.send_to(&player, started.clone()).await;
            }
        }

        self.send_to(identity, started).await;
        Ok(())
    }

    /// `in_progress -> finished`; clears stored membership and resets every
    /// affiliated connection to `connected`.
    async fn end_lobby(&self, identity: &str, lobby_id: &str) -> Result<(), EngineError> {
        self.master_connection(identity).await?;
        let lobby = self.owned_lobby(identity, lobby_id).await?;
        if lobby.status != LobbyStatus::InProgress {
            return Err(EngineError::InvalidState("lobby is not in progress".into()));
        }

        self.store
            .set_lobby_status(lobby_id, LobbyStatus::Finished)
            .await?;
        self.store.clear_members(lobby_id).await?;
        info!(identity, lobby_id, "game ended");

        let ended = ServerMessage::GameEnded {
            message: "the game has ended".into(),
        };
        for player in self.registry.player_identities().await {
            let Some(conn) = self.registry.get(&player).await else {
                continue;
            };
            if conn.lobby_id.as_deref() == Some(lobby_id) {
                self.registry
                    .update(&player, |c| {
                        c.status = PlayerStatus::Connected;
                        c.lobby_id = None;
                    })
                    .await;
                self.send_to(&player, ended.clone()).await;
            }
        }

        self.send_to(
            identity,
            ServerMessage::GameEnded {
                message: "you ended the game".into(),
            },
        )
        .await;
        Ok(())
    }

    /// Delete a `waiting` lobby after resetting every connection still ready
    /// for it.
    async fn delete_lobby(&self, identity: &str, lobby_id: &str) -> Result<(), EngineError> {
        self.master_connection(identity).await?;
        let lobby = self.owned_lobby(identity, lobby_id).await?;
        if lobby.status != LobbyStatus::Waiting {
            return Err(EngineError::InvalidState(
                "only a waiting lobby can be deleted".into(),
            ));
        }

        let deleted = ServerMessage::LobbyDeleted {
            message: "the lobby you were ready for was deleted".into(),
        };
        for player in self.registry.player_identities().await {
            let Some(conn) = self.registry.get(&player).await else {
                continue;
            };
            if conn.lobby_id.as_deref() == Some(lobby_id) && conn.status == PlayerStatus::Ready {
                self.registry
                    .update(&player, |c| {
                        c.status = PlayerStatus::Connected;
                        c.lobby_id = None;
                    })
                    .await;
                self.send_to(&player, deleted.clone()).await;
            }
        }

        self.store.clear_members(lobby_id).await?;
        self.store.delete_lobby(lobby_id).await?;
        info!(identity, lobby_id, "lobby deleted");

        self.send_to(
            identity,
            ServerMessage::LobbyDeleted {
                message: "lobby deleted".into(),
            },
        )
        .await;
        Ok(())
    }

    // =========================================================================
    // DISCONNECT
    // =========================================================================

    /// Tear down a connection: best-effort lobby membership cleanup, then
    /// unconditional removal. Safe to call from both the normal-disconnect
    /// path and the error path; the first call wins and later calls no-op.
    pub async fn disconnect(&self, identity: &str) {
        let Some(conn) = self.registry.unregister(identity).await else {
            return;
        };

        if conn.role == Role::Player {
            if let (Some(lobby_id), Some(character_id)) = (&conn.lobby_id, &conn.character_id) {
                match self.store.get_lobby(lobby_id).await {
                    Ok(Some(lobby)) if lobby.status.accepts_members() => {
                        if let Err(e) = self.store.remove_member(lobby_id, character_id).await {
                            warn!(identity, lobby_id, error = %e, "membership cleanup failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(identity, lobby_id, error = %e, "lobby lookup failed on disconnect")
                    }
                }
            }
        }

        info!(identity, role = ?conn.role, "disconnected");
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Targeted best-effort send; a dead channel is logged and ignored here
    /// (the broadcaster owns pruning).
    pub(crate) async fn send_to(&self, identity: &str, msg: ServerMessage) {
        if let Some(sender) = self.registry.sender(identity).await {
            if sender.send(msg).await.is_err() {
                debug!(identity, "dropped message: channel closed");
            }
        }
    }

    async fn player_connection(&self, identity: &str) -> Result<Connection, EngineError> {
        let conn = self.connection(identity).await?;
        if conn.role != Role::Player {
            return Err(EngineError::Authorization(
                "this operation requires a player connection".into(),
            ));
        }
        Ok(conn)
    }

    async fn master_connection(&self, identity: &str) -> Result<Connection, EngineError> {
        let conn = self.connection(identity).await?;
        if conn.role != Role::Master {
            return Err(EngineError::Authorization(
                "this operation requires a master connection".into(),
            ));
        }
        Ok(conn)
    }

    async fn connection(&self, identity: &str) -> Result<Connection, EngineError> {
        self.registry
            .get(identity)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("connection for {identity}")))
    }

    fn selected_character<'a>(&self, conn: &'a Connection) -> Result<&'a str, EngineError> {
        conn.character_id
            .as_deref()
            .ok_or_else(|| EngineError::InvalidState("no character selected".into()))
    }

    async fn require_lobby(&self, lobby_id: &str) -> Result<LobbyRecord, EngineError> {
        self.store
            .get_lobby(lobby_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("lobby {lobby_id}")))
    }

    async fn owned_lobby(&self, identity: &str, lobby_id: &str) -> Result<LobbyRecord, EngineError> {
        let lobby = self.require_lobby(lobby_id).await?;
        if lobby.master_identity != identity {
            return Err(EngineError::Authorization(
                "lobby does not belong to you".into(),
            ));
        }
        Ok(lobby)
    }
}
