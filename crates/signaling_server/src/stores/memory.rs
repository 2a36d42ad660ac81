//! Single-process store backed by concurrent maps
//!
//! Each lobby and each pending disconnect is one map entry, so the shard
//! lock taken by `entry`/`get_mut`/`remove_if` is what makes a mutation
//! atomic for that key. There is no lock spanning the whole store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{LocalHub, Lobby, LobbySettings, PendingDisconnect, Store, Subscription};
use crate::error::StoreError;

type Key = (String, String);

fn key(game: &str, id: &str) -> Key {
    (game.to_string(), id.to_string())
}

#[derive(Default)]
pub struct MemoryStore {
    lobbies: DashMap<Key, Lobby>,
    disconnects: DashMap<Key, PendingDisconnect>,
    hub: LocalHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.len()
    }

    pub fn pending_disconnect_count(&self) -> usize {
        self.disconnects.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_lobby(
        &self,
        game: &str,
        code: &str,
        owner: &str,
        settings: &LobbySettings,
    ) -> Result<Lobby, StoreError> {
        match self.lobbies.entry(key(game, code)) {
            Entry::Occupied(_) => Err(StoreError::LobbyExists),
            Entry::Vacant(slot) => {
                let lobby = Lobby {
                    code: code.to_string(),
                    owner: owner.to_string(),
                    public: settings.public,
                    max_players: settings.max_players,
                    peers: vec![owner.to_string()],
                    created_at: Utc::now(),
                };
                slot.insert(lobby.clone());
                debug!(game = %game, lobby = %code, owner = %owner, "lobby stored");
                Ok(lobby)
            }
        }
    }

    async fn join_lobby(&self, game: &str, code: &str, peer_id: &str) -> Result<Lobby, StoreError> {
        let mut lobby = self
            .lobbies
            .get_mut(&key(game, code))
            .ok_or(StoreError::LobbyNotFound)?;

        if !lobby.has_member(peer_id) {
            if lobby.is_full() {
                return Err(StoreError::LobbyFull);
            }
            lobby.peers.push(peer_id.to_string());
        }

        Ok(lobby.clone())
    }

    async fn leave_lobby(
        &self,
        game: &str,
        code: &str,
        peer_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let key = key(game, code);
        let remaining = {
            let mut lobby = self.lobbies.get_mut(&key).ok_or(StoreError::LobbyNotFound)?;
            lobby.peers.retain(|p| p != peer_id);
            lobby.peers.clone()
        };

        if remaining.is_empty() && self.lobbies.remove_if(&key, |_, l| l.peers.is_empty()).is_some() {
            info!(game = %game, lobby = %code, "lobby removed (empty)");
        }

        Ok(remaining)
    }

    async fn get_lobby(&self, game: &str, code: &str) -> Result<Lobby, StoreError> {
        self.lobbies
            .get(&key(game, code))
            .map(|l| l.clone())
            .ok_or(StoreError::LobbyNotFound)
    }

    async fn list_lobbies(&self, game: &str) -> Result<Vec<Lobby>, StoreError> {
        let mut lobbies: Vec<Lobby> = self
            .lobbies
            .iter()
            .filter(|entry| entry.key().0 == game && entry.value().public)
            .map(|entry| entry.value().clone())
            .collect();
        lobbies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(lobbies)
    }

    async fn record_disconnect(&self, record: PendingDisconnect) -> Result<(), StoreError> {
        self.disconnects
            .insert(key(&record.game, &record.peer_id), record);
        Ok(())
    }

    async fn claim_disconnect(
        &self,
        game: &str,
        peer_id: &str,
        secret: &str,
    ) -> Result<Option<PendingDisconnect>, StoreError> {
        Ok(self
            .disconnects
            .remove_if(&key(game, peer_id), |_, record| record.secret == secret)
            .map(|(_, record)| record))
    }

    async fn take_expired_disconnects(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingDisconnect>, StoreError> {
        let expired: Vec<Key> = self
            .disconnects
            .iter()
            .filter(|entry| entry.value().disconnected_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let taken = expired
            .into_iter()
            .filter_map(|k| {
                self.disconnects
                    .remove_if(&k, |_, record| record.disconnected_at < cutoff)
                    .map(|(_, record)| record)
            })
            .collect();

        self.hub.prune();
        Ok(taken)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), StoreError> {
        self.hub.publish(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        Ok(self.hub.subscribe(topic))
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
