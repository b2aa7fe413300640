//! WebSocket Session Server
//!
//! Accepts transport connections, performs the connect handshake
//! (authentication, role registration, character validation), and runs one
//! receive loop per connection feeding the [`Engine`] dispatcher. One
//! background broadcaster task runs for the lifetime of the process.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::network::auth::{verify_credential, AuthConfig};
use crate::network::broadcast::{collect_snapshot, Broadcaster};
use crate::network::engine::Engine;
use crate::network::protocol::{ClientMessage, PlayerStatus, Role, ServerMessage};
use crate::network::registry::{Connection, Registry};
use crate::store::{LobbyStatus, Store};

/// Per-connection outbound channel capacity.
const SEND_QUEUE_CAPACITY: usize = 64;

/// Session server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    auth: AuthConfig,
    engine: Arc<Engine>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionServer {
    /// Wire up a server over a persistence collaborator.
    pub fn new(config: ServerConfig, auth: AuthConfig, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(Registry::new());
        let engine = Arc::new(Engine::new(registry, store));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            auth,
            engine,
            shutdown_tx,
        }
    }

    /// The shared engine (exposed for embedding and tests).
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("session server listening on {}", self.config.bind_addr);

        let broadcaster = Broadcaster::new(
            self.engine.clone(),
            self.config.broadcast_period,
            self.shutdown_tx.subscribe(),
        );
        let broadcaster_handle = tokio::spawn(broadcaster.run());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.engine.registry().len().await >= self.config.max_connections {
                                warn!(%addr, "connection limit reached, rejecting");
                                continue;
                            }
                            debug!(%addr, "new connection");
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        broadcaster_handle.abort();
        Ok(())
    }

    /// Signal shutdown to the accept loop, the broadcaster, and every
    /// connection task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let engine = self.engine.clone();
        let auth = self.auth.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(engine, auth, stream, addr, shutdown_rx).await {
                debug!(%addr, error = %e, "connection closed with error");
            }
        });
    }
}

/// Drive one transport session: handshake, receive loop, cleanup.
async fn handle_connection(
    engine: Arc<Engine>,
    auth: AuthConfig,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(SEND_QUEUE_CAPACITY);

    // Sender task: owns the write half for the lifetime of the session.
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handshake: the first text frame must be a connect message.
    let identity = match read_text_frame(&mut ws_receiver).await {
        Some(text) => match establish(&engine, &auth, &text, &msg_tx, addr).await {
            Some(identity) => identity,
            None => {
                // Give the sender task a moment to flush the rejection.
                drop(msg_tx);
                let _ = sender_task.await;
                return Ok(());
            }
        },
        None => {
            sender_task.abort();
            return Ok(());
        }
    };

    // Receive loop: strictly in arrival order for this connection.
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::from_json(&text) {
                            Ok(client_msg) => engine.handle_message(&identity, client_msg).await,
                            Err(e) => {
                                debug!(identity, error = %e, "malformed message");
                                let _ = msg_tx
                                    .send(ServerMessage::Error {
                                        message: "invalid message format".into(),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(identity, "client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(identity, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx
                    .send(ServerMessage::Redirect {
                        target: "/".into(),
                        message: "server shutting down".into(),
                    })
                    .await;
                break;
            }
        }
    }

    // Single cleanup path for both normal disconnect and error exit. Skip it
    // when this session was superseded by a newer connect for the same
    // identity; the registry entry then belongs to the newer session.
    let owns_entry = match engine.registry().get(&identity).await {
        Some(conn) => conn.sender.same_channel(&msg_tx),
        None => false,
    };
    if owns_entry {
        engine.disconnect(&identity).await;
    }
    sender_task.abort();
    Ok(())
}

/// Read frames until the first text payload; None means the peer went away.
async fn read_text_frame<S>(ws_receiver: &mut S) -> Option<String>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    }
}

/// Validate the connect message and register the connection. Returns the
/// authenticated identity, or None when the session was rejected (the
/// rejection reply has already been queued).
async fn establish(
    engine: &Arc<Engine>,
    auth: &AuthConfig,
    text: &str,
    msg_tx: &mpsc::Sender<ServerMessage>,
    addr: SocketAddr,
) -> Option<String> {
    let (credential, role, character_id, lobby_id) = match ClientMessage::from_json(text) {
        Ok(ClientMessage::Connect {
            credential,
            role,
            character_id,
            lobby_id,
        }) => (credential, role, character_id, lobby_id),
        Ok(_) => {
            let _ = msg_tx
                .send(ServerMessage::Error {
                    message: "first message must be connect".into(),
                })
                .await;
            return None;
        }
        Err(e) => {
            debug!(%addr, error = %e, "malformed connect");
            let _ = msg_tx
                .send(ServerMessage::Error {
                    message: "invalid message format".into(),
                })
                .await;
            return None;
        }
    };

    let identity = match verify_credential(&credential, auth) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%addr, error = %e, "connection rejected: bad credential");
            let _ = msg_tx
                .send(ServerMessage::Error {
                    message: "authentication failed".into(),
                })
                .await;
            return None;
        }
    };

    match role {
        Role::Master => establish_master(engine, identity, msg_tx).await,
        Role::Player => {
            establish_player(engine, identity, character_id, lobby_id, msg_tx).await
        }
    }
}

async fn establish_master(
    engine: &Arc<Engine>,
    identity: String,
    msg_tx: &mpsc::Sender<ServerMessage>,
) -> Option<String> {
    let username = engine
        .store()
        .username_for_identity(&identity)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| identity.clone());

    let superseded = engine
        .registry()
        .register(Connection::master(
            identity.clone(),
            username,
            msg_tx.clone(),
        ))
        .await;
    if superseded.is_some() {
        warn!(identity, "superseding existing connection");
    }
    info!(identity, "master connected");

    // Populate the panel immediately instead of waiting for the first tick.
    let players = collect_snapshot(engine).await;
    let _ = msg_tx.send(ServerMessage::PlayersSnapshot { players }).await;
    Some(identity)
}

async fn establish_player(
    engine: &Arc<Engine>,
    identity: String,
    character_id: Option<String>,
    lobby_id: Option<String>,
    msg_tx: &mpsc::Sender<ServerMessage>,
) -> Option<String> {
    let store = engine.store();

    let Some(character_id) = character_id else {
        let _ = msg_tx
            .send(ServerMessage::Redirect {
                target: "/player".into(),
                message: "no character selected".into(),
            })
            .await;
        return None;
    };

    match store.character_owned_by(&character_id, &identity).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(identity, character_id, "rejected: foreign character");
            let _ = msg_tx
                .send(ServerMessage::Redirect {
                    target: "/player".into(),
                    message: "character does not belong to this user".into(),
                })
                .await;
            return None;
        }
        Err(e) => {
            error!(identity, error = %e, "ownership check failed");
            let _ = msg_tx
                .send(ServerMessage::Error {
                    message: "internal error".into(),
                })
                .await;
            return None;
        }
    }

    // Rejoin path: a connect carrying a lobby id re-enters a running game.
    let (status, lobby_id) = match lobby_id {
        Some(lobby_id) => match store.get_lobby(&lobby_id).await {
            Ok(Some(lobby))
                if lobby.status == LobbyStatus::InProgress && lobby.has_member(&character_id) =>
            {
                info!(identity, lobby_id, "player rejoining running game");
                (PlayerStatus::InGame, Some(lobby_id))
            }
            _ => {
                let _ = msg_tx
                    .send(ServerMessage::Redirect {
                        target: "/player".into(),
                        message: "could not rejoin the game".into(),
                    })
                    .await;
                return None;
            }
        },
        None => (PlayerStatus::Connected, None),
    };

    let state = match store.get_character(&character_id).await {
        Ok(Some(record)) => record.state,
        _ => {
            let _ = msg_tx
                .send(ServerMessage::Redirect {
                    target: "/player".into(),
                    message: "selected character state not found".into(),
                })
                .await;
            return None;
        }
    };

    let username = store
        .username_for_character(&character_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| identity.clone());

    let superseded = engine
        .registry()
        .register(Connection::player(
            identity.clone(),
            username,
            msg_tx.clone(),
            character_id.clone(),
            status,
            lobby_id.clone(),
        ))
        .await;
    if superseded.is_some() {
        warn!(identity, "superseding existing connection");
    }
    info!(identity, character_id, ?status, "player connected");

    let _ = msg_tx
        .send(ServerMessage::CharacterUpdate {
            character_id,
            state,
        })
        .await;
    if let Some(lobby_id) = lobby_id {
        let _ = msg_tx.send(ServerMessage::GameStarted { lobby_id }).await;
    }

    Some(identity)
}
