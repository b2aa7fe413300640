//! Connection Registry
//!
//! In-memory table of live connections keyed by authenticated identity.
//! One writer at a time per entry (each connection's own task), concurrent
//! reads by the broadcaster, concurrent writers across identities. The
//! `RwLock` guarantees no half-updated entry is ever observable.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, RwLock};

use crate::network::protocol::{PlayerStatus, Role, ServerMessage};

/// Metadata for one live connection.
///
/// `character_id`, `status` and `lobby_id` carry meaning only for
/// `Role::Player` connections.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Stable user identity; unique key into the registry.
    pub identity: String,
    /// Role declared at connect time. Immutable.
    pub role: Role,
    /// Display name, resolved at connect time.
    pub username: String,
    /// Outbound channel to this connection's sender task.
    pub sender: mpsc::Sender<ServerMessage>,
    /// Selected character (players only).
    pub character_id: Option<String>,
    /// Readiness status (players only).
    pub status: PlayerStatus,
    /// Affiliated lobby (players only). Set whenever `status` is not
    /// `Connected`.
    pub lobby_id: Option<String>,
}

impl Connection {
    /// Build a master connection entry.
    pub fn master(identity: String, username: String, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            identity,
            role: Role::Master,
            username,
            sender,
            character_id: None,
            status: PlayerStatus::Connected,
            lobby_id: None,
        }
    }

    /// Build a player connection entry.
    pub fn player(
        identity: String,
        username: String,
        sender: mpsc::Sender<ServerMessage>,
        character_id: String,
        status: PlayerStatus,
        lobby_id: Option<String>,
    ) -> Self {
        Self {
            identity,
            role: Role::Player,
            username,
            sender,
            character_id: Some(character_id),
            status,
            lobby_id,
        }
    }
}

/// Registry of live connections.
#[derive(Default)]
pub struct Registry {
    connections: RwLock<BTreeMap<String, Connection>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any prior entry for the identity.
    /// Returns the superseded entry if there was one; the caller decides
    /// whether to close its transport.
    pub async fn register(&self, conn: Connection) -> Option<Connection> {
        let mut connections = self.connections.write().await;
        connections.insert(conn.identity.clone(), conn)
    }

    /// Remove an entry. Idempotent.
    pub async fn unregister(&self, identity: &str) -> Option<Connection> {
        let mut connections = self.connections.write().await;
        connections.remove(identity)
    }

    /// Snapshot of one entry.
    pub async fn get(&self, identity: &str) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections.get(identity).cloned()
    }

    /// Serialized mutation entry point. All cross-task mutations of a
    /// connection's state go through here. Returns false if the entry is gone.
    pub async fn update<F>(&self, identity: &str, f: F) -> bool
    where
        F: FnOnce(&mut Connection),
    {
        let mut connections = self.connections.write().await;
        match connections.get_mut(identity) {
            Some(conn) => {
                f(conn);
                true
            }
            None => false,
        }
    }

    /// Identities of all player connections. A snapshot: entries may mutate
    /// or disappear before the caller gets to them, so re-check with `get`.
    pub async fn player_identities(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.role == Role::Player)
            .map(|c| c.identity.clone())
            .collect()
    }

    /// Identities of all master connections. Snapshot semantics as above.
    pub async fn master_identities(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.role == Role::Master)
            .map(|c| c.identity.clone())
            .collect()
    }

    /// Clone of an entry's outbound channel, for targeted sends.
    pub async fn sender(&self, identity: &str) -> Option<mpsc::Sender<ServerMessage>> {
        let connections = self.connections.read().await;
        connections.get(identity).map(|c| c.sender.clone())
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_entry(identity: &str) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::player(
            identity.to_string(),
            format!("{}-name", identity),
            tx,
            format!("{}-char", identity),
            PlayerStatus::Connected,
            None,
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = Registry::new();
        let (conn, _rx) = player_entry("u1");

        assert!(registry.register(conn).await.is_none());
        let found = registry.get("u1").await.unwrap();
        assert_eq!(found.role, Role::Player);
        assert_eq!(found.character_id.as_deref(), Some("u1-char"));
        assert!(registry.get("u2").await.is_none());
    }

    #[tokio::test]
    async fn test_at_most_one_entry_per_identity() {
        let registry = Registry::new();
        let (first, _rx1) = player_entry("u1");
        let (mut second, _rx2) = player_entry("u1");
        second.username = "replacement".into();

        registry.register(first).await;
        let superseded = registry.register(second).await;

        assert!(superseded.is_some());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("u1").await.unwrap().username, "replacement");
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = Registry::new();
        let (conn, _rx) = player_entry("u1");
        registry.register(conn).await;

        assert!(registry.unregister("u1").await.is_some());
        assert!(registry.unregister("u1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_mutates_in_place() {
        let registry = Registry::new();
        let (conn, _rx) = player_entry("u1");
        registry.register(conn).await;

        let touched = registry
            .update("u1", |c| {
                c.status = PlayerStatus::Ready;
                c.lobby_id = Some("l1".into());
            })
            .await;
        assert!(touched);

        let found = registry.get("u1").await.unwrap();
        assert_eq!(found.status, PlayerStatus::Ready);
        assert_eq!(found.lobby_id.as_deref(), Some("l1"));

        assert!(!registry.update("ghost", |_| {}).await);
    }

    #[tokio::test]
    async fn test_role_filters() {
        let registry = Registry::new();
        let (p1, _rx1) = player_entry("p1");
        let (p2, _rx2) = player_entry("p2");
        let (tx, _rx3) = mpsc::channel(8);
        let master = Connection::master("m1".into(), "gm".into(), tx);

        registry.register(p1).await;
        registry.register(p2).await;
        registry.register(master).await;

        let players = registry.player_identities().await;
        let masters = registry.master_identities().await;
        assert_eq!(players, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(masters, vec!["m1".to_string()]);
    }
}
