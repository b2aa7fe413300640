//! Broadcast Scheduler
//!
//! The only component not driven by inbound messages: a recurring task that
//! snapshots every active player's character state and fans it out to all
//! master connections. A master whose channel is gone is pruned from the
//! registry as an implicit disconnect; the remaining sends are unaffected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::network::engine::Engine;
use crate::network::protocol::{PlayerSnapshot, ServerMessage};

/// Assemble the snapshot of all players whose status is `ready` or
/// `in_game`, keyed by character id. Players whose stored character has
/// vanished are skipped rather than reported.
pub async fn collect_snapshot(engine: &Engine) -> BTreeMap<String, PlayerSnapshot> {
    let registry = engine.registry();
    let store = engine.store();

    let mut players = BTreeMap::new();
    for identity in registry.player_identities().await {
        // Entries may have mutated or vanished since the key snapshot.
        let Some(conn) = registry.get(&identity).await else {
            continue;
        };
        if !conn.status.is_active() {
            continue;
        }
        let Some(character_id) = conn.character_id.clone() else {
            continue;
        };

        let record = match store.get_character(&character_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(identity, character_id, "skipping vanished character");
                continue;
            }
            Err(e) => {
                warn!(identity, character_id, error = %e, "character load failed");
                continue;
            }
        };
        let username = store
            .username_for_character(&character_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| conn.username.clone());

        players.insert(
            character_id,
            PlayerSnapshot {
                state: record.state,
                status: conn.status,
                username,
                lobby_id: conn.lobby_id,
            },
        );
    }
    players
}

/// Run a single broadcast pass: snapshot, then non-blocking fan-out to every
/// master. A closed channel prunes the master; a full one only drops this
/// tick's message.
pub async fn broadcast_once(engine: &Engine) {
    let players = collect_snapshot(engine).await;
    let msg = ServerMessage::PlayersSnapshot { players };

    for master in engine.registry().master_identities().await {
        let Some(sender) = engine.registry().sender(&master).await else {
            continue;
        };
        match sender.try_send(msg.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(master, "master channel full, dropping snapshot")
            }
            Err(TrySendError::Closed(_)) => {
                info!(master, "pruning unreachable master");
                engine.disconnect(&master).await;
            }
        }
    }
}

/// The periodic broadcaster task.
pub struct Broadcaster {
    engine: Arc<Engine>,
    period: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Broadcaster {
    /// Create a broadcaster ticking every `period`.
    pub fn new(engine: Arc<Engine>, period: Duration, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            engine,
            period,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = self.period.as_secs_f64(), "broadcaster running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broadcast_once(&self.engine).await;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("broadcaster stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::PlayerStatus;
    use crate::network::registry::{Connection, Registry};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn make_engine() -> (Arc<Engine>, Arc<Registry>, Arc<MemoryStore>) {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(
            registry.clone(),
            store.clone() as Arc<dyn Store>,
        ));
        (engine, registry, store)
    }

    async fn add_player(
        registry: &Registry,
        store: &MemoryStore,
        identity: &str,
        status: PlayerStatus,
        lobby_id: Option<&str>,
    ) -> (String, mpsc::Receiver<ServerMessage>) {
        store.insert_user(identity, &format!("{identity}-name")).await;
        let character_id = store.create_character(identity, json!({"hp": 10})).await;
        let (tx, rx) = mpsc::channel(16);
        registry
            .register(Connection::player(
                identity.to_string(),
                format!("{identity}-name"),
                tx,
                character_id.clone(),
                status,
                lobby_id.map(String::from),
            ))
            .await;
        (character_id, rx)
    }

    #[tokio::test]
    async fn test_snapshot_includes_only_active_players() {
        let (engine, registry, store) = make_engine().await;
        let (ready_char, _rx1) =
            add_player(&registry, &store, "p1", PlayerStatus::Ready, Some("l1")).await;
        let (in_game_char, _rx2) =
            add_player(&registry, &store, "p2", PlayerStatus::InGame, Some("l1")).await;
        let (_idle_char, _rx3) =
            add_player(&registry, &store, "p3", PlayerStatus::Connected, None).await;

        let players = collect_snapshot(&engine).await;
        assert_eq!(players.len(), 2);
        assert!(players.contains_key(&ready_char));
        assert!(players.contains_key(&in_game_char));
        assert_eq!(players[&ready_char].username, "p1-name");
        assert_eq!(players[&ready_char].lobby_id.as_deref(), Some("l1"));
    }

    #[tokio::test]
    async fn test_snapshot_skips_vanished_character() {
        let (engine, registry, store) = make_engine().await;
        store.insert_user("p1", "alice").await;
        let (tx, _rx) = mpsc::channel(16);
        registry
            .register(Connection::player(
                "p1".into(),
                "alice".into(),
                tx,
                "no-such-character".into(),
                PlayerStatus::Ready,
                Some("l1".into()),
            ))
            .await;

        let players = collect_snapshot(&engine).await;
        assert!(players.is_empty());
    }

    #[tokio::test]
    async fn test_dead_master_pruned_without_aborting_fanout() {
        let (engine, registry, store) = make_engine().await;
        let (_char, _rx_p) =
            add_player(&registry, &store, "p1", PlayerStatus::Ready, Some("l1")).await;

        // Live master.
        let (tx_live, mut rx_live) = mpsc::channel(16);
        registry
            .register(Connection::master("m-live".into(), "gm".into(), tx_live))
            .await;

        // Dead master: receiver dropped, channel closed.
        let (tx_dead, rx_dead) = mpsc::channel(16);
        drop(rx_dead);
        registry
            .register(Connection::master("m-dead".into(), "gm2".into(), tx_dead))
            .await;

        broadcast_once(&engine).await;

        assert!(registry.get("m-dead").await.is_none());
        assert!(registry.get("m-live").await.is_some());
        match rx_live.try_recv().unwrap() {
            ServerMessage::PlayersSnapshot { players } => assert_eq!(players.len(), 1),
            other => panic!("expected players_snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcaster_stops_on_shutdown() {
        let (engine, _registry, _store) = make_engine().await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(
            Broadcaster::new(engine, Duration::from_millis(10), shutdown_rx).run(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("broadcaster did not stop")
            .unwrap();
    }
}
