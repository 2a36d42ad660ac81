//! Store shared by several relay instances through PostgreSQL
//!
//! Membership changes run in a transaction holding the lobby row lock
//! (`SELECT ... FOR UPDATE`), claims and sweeps use `DELETE ... RETURNING`
//! so a record is handed to exactly one caller. Pub/sub rides on
//! `pg_notify`: every instance `LISTEN`s on one channel and fans
//! notifications out to its local subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{LocalHub, Lobby, LobbySettings, PendingDisconnect, Store, Subscription};
use crate::error::StoreError;

const NOTIFY_CHANNEL: &str = "pulsar_signaling";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS lobbies (
        game TEXT NOT NULL,
        code TEXT NOT NULL,
        owner TEXT NOT NULL,
        public BOOLEAN NOT NULL DEFAULT FALSE,
        max_players INTEGER,
        peers TEXT[] NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (game, code)
    )",
    "CREATE TABLE IF NOT EXISTS pending_disconnects (
        game TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        secret TEXT NOT NULL,
        lobby TEXT,
        disconnected_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (game, peer_id)
    )",
    "CREATE INDEX IF NOT EXISTS pending_disconnects_at ON pending_disconnects (disconnected_at)",
];

const LOBBY_COLUMNS: &str = "code, owner, public, max_players, peers, created_at";
const DISCONNECT_COLUMNS: &str = "game, peer_id, secret, lobby, disconnected_at";

#[derive(Serialize, Deserialize)]
struct Notification {
    topic: String,
    payload: String,
}

pub struct PostgresStore {
    pool: PgPool,
    hub: Arc<LocalHub>,
    listener: AbortHandle,
}

impl PostgresStore {
    /// Connect, create the schema if needed and start listening for
    /// notifications from other instances.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let hub = Arc::new(LocalHub::new());
        let listener = tokio::spawn(listen_loop(listener, hub.clone())).abort_handle();

        info!(channel = NOTIFY_CHANNEL, "postgres store ready");

        Ok(Self {
            pool,
            hub,
            listener,
        })
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_loop(mut listener: PgListener, hub: Arc<LocalHub>) {
    loop {
        match listener.recv().await {
            Ok(notification) => {
                match serde_json::from_str::<Notification>(notification.payload()) {
                    Ok(n) => {
                        hub.publish(&n.topic, n.payload);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed notification"),
                }
            }
            Err(e) => {
                // recv reconnects on the next call
                error!(error = %e, "postgres listener error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn lobby_from_row(row: &PgRow) -> Result<Lobby, StoreError> {
    Ok(Lobby {
        code: row.try_get("code")?,
        owner: row.try_get("owner")?,
        public: row.try_get("public")?,
        max_players: row
            .try_get::<Option<i32>, _>("max_players")?
            .map(|m| m.max(0) as u32),
        peers: row.try_get("peers")?,
        created_at: row.try_get("created_at")?,
    })
}

fn disconnect_from_row(row: &PgRow) -> Result<PendingDisconnect, StoreError> {
    Ok(PendingDisconnect {
        game: row.try_get("game")?,
        peer_id: row.try_get("peer_id")?,
        secret: row.try_get("secret")?,
        lobby: row.try_get("lobby")?,
        disconnected_at: row.try_get("disconnected_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create_lobby(
        &self,
        game: &str,
        code: &str,
        owner: &str,
        settings: &LobbySettings,
    ) -> Result<Lobby, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO lobbies (game, code, owner, public, max_players, peers)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (game, code) DO NOTHING
             RETURNING {LOBBY_COLUMNS}"
        ))
        .bind(game)
        .bind(code)
        .bind(owner)
        .bind(settings.public)
        .bind(settings.max_players.map(|m| m.min(i32::MAX as u32) as i32))
        .bind(vec![owner.to_string()])
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::LobbyExists)?;

        debug!(game = %game, lobby = %code, owner = %owner, "lobby stored");
        lobby_from_row(&row)
    }

    async fn join_lobby(&self, game: &str, code: &str, peer_id: &str) -> Result<Lobby, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {LOBBY_COLUMNS} FROM lobbies WHERE game = $1 AND code = $2 FOR UPDATE"
        ))
        .bind(game)
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::LobbyNotFound)?;

        let mut lobby = lobby_from_row(&row)?;
        if lobby.has_member(peer_id) {
            return Ok(lobby);
        }
        if lobby.is_full() {
            return Err(StoreError::LobbyFull);
        }
        lobby.peers.push(peer_id.to_string());

        sqlx::query("UPDATE lobbies SET peers = $3 WHERE game = $1 AND code = $2")
            .bind(game)
            .bind(code)
            .bind(lobby.peers.clone())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(lobby)
    }

    async fn leave_lobby(
        &self,
        game: &str,
        code: &str,
        peer_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT peers FROM lobbies WHERE game = $1 AND code = $2 FOR UPDATE")
            .bind(game)
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::LobbyNotFound)?;

        let mut peers: Vec<String> = row.try_get("peers")?;
        peers.retain(|p| p != peer_id);

        if peers.is_empty() {
            sqlx::query("DELETE FROM lobbies WHERE game = $1 AND code = $2")
                .bind(game)
                .bind(code)
                .execute(&mut *tx)
                .await?;
            info!(game = %game, lobby = %code, "lobby removed (empty)");
        } else {
            sqlx::query("UPDATE lobbies SET peers = $3 WHERE game = $1 AND code = $2")
                .bind(game)
                .bind(code)
                .bind(peers.clone())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(peers)
    }

    async fn get_lobby(&self, game: &str, code: &str) -> Result<Lobby, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOBBY_COLUMNS} FROM lobbies WHERE game = $1 AND code = $2"
        ))
        .bind(game)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::LobbyNotFound)?;

        lobby_from_row(&row)
    }

    async fn list_lobbies(&self, game: &str) -> Result<Vec<Lobby>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOBBY_COLUMNS} FROM lobbies
             WHERE game = $1 AND public
             ORDER BY created_at
             LIMIT 100"
        ))
        .bind(game)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lobby_from_row).collect()
    }

    async fn record_disconnect(&self, record: PendingDisconnect) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_disconnects (game, peer_id, secret, lobby, disconnected_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (game, peer_id) DO UPDATE
             SET secret = EXCLUDED.secret,
                 lobby = EXCLUDED.lobby,
                 disconnected_at = EXCLUDED.disconnected_at",
        )
        .bind(&record.game)
        .bind(&record.peer_id)
        .bind(&record.secret)
        .bind(&record.lobby)
        .bind(record.disconnected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_disconnect(
        &self,
        game: &str,
        peer_id: &str,
        secret: &str,
    ) -> Result<Option<PendingDisconnect>, StoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM pending_disconnects
             WHERE game = $1 AND peer_id = $2 AND secret = $3
             RETURNING {DISCONNECT_COLUMNS}"
        ))
        .bind(game)
        .bind(peer_id)
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(disconnect_from_row).transpose()
    }

    async fn take_expired_disconnects(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingDisconnect>, StoreError> {
        let rows = sqlx::query(&format!(
            "DELETE FROM pending_disconnects
             WHERE disconnected_at < $1
             RETURNING {DISCONNECT_COLUMNS}"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        self.hub.prune();
        rows.iter().map(disconnect_from_row).collect()
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), StoreError> {
        let notification = serde_json::to_string(&Notification {
            topic: topic.to_string(),
            payload,
        })?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(notification)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        Ok(self.hub.subscribe(topic))
    }

    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Only runs against a real database
    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("SIGNALING_TEST_DATABASE_URL").ok()?;
        Some(PostgresStore::connect(&url).await.unwrap())
    }

    #[tokio::test]
    async fn test_lobby_lifecycle() {
        let Some(store) = test_store().await else {
            return;
        };
        let game = uuid::Uuid::new_v4().to_string();

        let lobby = store
            .allocate_lobby(&game, "a", &LobbySettings::default(), 4)
            .await
            .unwrap();
        let joined = store.join_lobby(&game, &lobby.code, "b").await.unwrap();
        assert_eq!(joined.peers, vec!["a", "b"]);

        assert_eq!(store.leave_lobby(&game, &lobby.code, "a").await.unwrap(), vec!["b"]);
        assert!(store.leave_lobby(&game, &lobby.code, "b").await.unwrap().is_empty());
        assert!(matches!(
            store.get_lobby(&game, &lobby.code).await,
            Err(StoreError::LobbyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_claim_and_sweep() {
        let Some(store) = test_store().await else {
            return;
        };
        let game = uuid::Uuid::new_v4().to_string();
        let record = PendingDisconnect {
            game: game.clone(),
            peer_id: "a".into(),
            secret: "s".into(),
            lobby: None,
            disconnected_at: Utc::now() - chrono::Duration::seconds(10),
        };

        store.record_disconnect(record.clone()).await.unwrap();
        assert!(store.claim_disconnect(&game, "a", "s").await.unwrap().is_some());
        assert!(store.claim_disconnect(&game, "a", "s").await.unwrap().is_none());

        store.record_disconnect(record).await.unwrap();
        let expired = store.take_expired_disconnects(Utc::now()).await.unwrap();
        assert!(expired.iter().any(|r| r.game == game && r.peer_id == "a"));
    }

    #[tokio::test]
    async fn test_notify_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };
        let topic = format!("{}:a", uuid::Uuid::new_v4());
        let mut sub = store.subscribe(&topic).await.unwrap();

        store.publish(&topic, "hello".into()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("hello"));
    }
}
