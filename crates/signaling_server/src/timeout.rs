//! Reconnect grace window
//!
//! A peer whose transport drops without a `close` packet keeps its lobby
//! seat for `grace`. Within that window a `hello` carrying the old id and
//! secret resumes the identity; afterwards the sweep evicts it and tells
//! the rest of the lobby.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::metrics::METRICS;
use crate::peer::{leave_and_notify, Peer, ReconnectHook};
use crate::stores::{PendingDisconnect, Store};

pub struct TimeoutManager {
    store: Arc<dyn Store>,
    grace: Duration,
    sweep_interval: Duration,
}

impl TimeoutManager {
    pub fn new(store: Arc<dyn Store>, grace: Duration, sweep_interval: Duration) -> Self {
        Self {
            store,
            grace,
            sweep_interval,
        }
    }

    /// Start the grace window for a peer whose connection is gone
    pub async fn disconnected(&self, peer: &Peer) {
        if peer.closed_packet_received() {
            return;
        }
        // Never identified, nothing to hold on to
        let Some(identity) = peer.identity() else {
            return;
        };

        let record = PendingDisconnect {
            game: identity.game.clone(),
            peer_id: identity.id.clone(),
            secret: identity.secret.clone(),
            lobby: peer.lobby().map(str::to_string),
            disconnected_at: Utc::now(),
        };

        match self.store.record_disconnect(record).await {
            Ok(()) => {
                METRICS.disconnects_recorded.inc();
                info!(
                    peer = %identity.id,
                    lobby = ?peer.lobby(),
                    grace_secs = self.grace.as_secs(),
                    "peer dropped, holding identity"
                );
            }
            Err(e) => {
                error!(peer = %identity.id, error = %e, "failed to record disconnect");
            }
        }
    }

    /// Sweep expired records until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            grace_secs = self.grace.as_secs(),
            interval_secs = self.sweep_interval.as_secs(),
            "disconnect sweeper started"
        );

        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(evicted) => debug!(evicted, "sweep finished"),
                        Err(e) => {
                            METRICS.sweep_failures.inc();
                            error!(error = %e, "sweep failed, retrying next tick");
                        }
                    }
                }
            }
        }

        info!("disconnect sweeper stopped");
    }

    /// Evict every peer whose grace window has elapsed
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.grace_delta();
        let expired = self.store.take_expired_disconnects(cutoff).await?;
        let count = expired.len();

        for record in expired {
            self.evict(record).await;
        }

        Ok(count)
    }

    async fn evict(&self, record: PendingDisconnect) {
        METRICS.sweep_evictions.inc();

        let Some(code) = record.lobby.as_deref() else {
            debug!(peer = %record.peer_id, "identity expired");
            return;
        };

        match leave_and_notify(self.store.as_ref(), &record.game, code, &record.peer_id).await {
            Ok(()) => info!(peer = %record.peer_id, lobby = %code, "grace window elapsed, peer evicted"),
            Err(e) => {
                warn!(peer = %record.peer_id, lobby = %code, error = %e, "eviction failed, re-queueing");
                // Put it back so the next tick retries
                if let Err(e) = self.store.record_disconnect(record).await {
                    error!(error = %e, "failed to re-queue eviction");
                }
            }
        }
    }

    fn grace_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[async_trait]
impl ReconnectHook for TimeoutManager {
    async fn reconnected(&self, game: &str, peer_id: &str, secret: &str) -> Option<PendingDisconnect> {
        let record = match self.store.claim_disconnect(game, peer_id, secret).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(peer = %peer_id, "no pending disconnect to claim");
                return None;
            }
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "failed to claim pending disconnect");
                return None;
            }
        };

        // Claimed between expiry and the next sweep: it is ours to evict
        if Utc::now() - record.disconnected_at > self.grace_delta() {
            debug!(peer = %peer_id, "claimed an expired identity");
            self.evict(record).await;
            return None;
        }

        info!(peer = %peer_id, lobby = ?record.lobby, "identity reclaimed");
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingConnection;
    use crate::peer::{PeerSettings, PeerState};
    use crate::stores::{peer_topic, LobbySettings, MemoryStore};
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// The receiver keeps the connection open; drop it to simulate a dead peer
    async fn identified_peer(
        store: Arc<MemoryStore>,
        hook: Arc<TimeoutManager>,
    ) -> (Peer, UnboundedReceiver<String>) {
        let (conn, rx) = RecordingConnection::new();
        let mut peer = Peer::new(
            store,
            conn,
            hook,
            PeerSettings::default(),
            CancellationToken::new(),
        );
        peer.handle_packet("hello", br#"{"type":"hello","game":"game"}"#)
            .await
            .unwrap();
        (peer, rx)
    }

    fn manager(store: &Arc<MemoryStore>, grace: Duration) -> Arc<TimeoutManager> {
        Arc::new(TimeoutManager::new(
            store.clone(),
            grace,
            Duration::from_millis(20),
        ))
    }

    #[tokio::test]
    async fn test_graceful_close_is_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_secs(60));
        let (mut peer, _rx) = identified_peer(store.clone(), timeouts.clone()).await;

        peer.handle_packet("close", br#"{"type":"close"}"#).await.unwrap();
        timeouts.disconnected(&peer).await;
        assert_eq!(store.pending_disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_unidentified_peer_is_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_secs(60));
        let (conn, _rx) = RecordingConnection::new();
        let peer = Peer::new(
            store.clone(),
            conn,
            timeouts.clone(),
            PeerSettings::default(),
            CancellationToken::new(),
        );

        timeouts.disconnected(&peer).await;
        assert_eq!(store.pending_disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_claims_once() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_secs(60));
        let (peer, _rx) = identified_peer(store.clone(), timeouts.clone()).await;
        let identity = peer.identity().unwrap().clone();

        timeouts.disconnected(&peer).await;
        assert_eq!(store.pending_disconnect_count(), 1);

        assert!(timeouts
            .reconnected("game", &identity.id, "wrong-secret")
            .await
            .is_none());

        let (first, second) = tokio::join!(
            timeouts.reconnected("game", &identity.id, &identity.secret),
            timeouts.reconnected("game", &identity.id, &identity.secret),
        );
        assert!(first.is_some() ^ second.is_some());
        assert_eq!(store.pending_disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_and_notifies_lobby() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_millis(30));
        let (mut peer, _rx) = identified_peer(store.clone(), timeouts.clone()).await;
        let id = peer.identity().unwrap().id.clone();

        peer.handle_packet("create", br#"{"type":"create"}"#).await.unwrap();
        let PeerState::LobbyOwner { code } = peer.state().clone() else {
            panic!("expected lobby owner");
        };
        store.join_lobby("game", &code, "other").await.unwrap();
        let mut other = store.subscribe(&peer_topic("game", "other")).await.unwrap();

        timeouts.disconnected(&peer).await;

        // Nothing is evicted while the window is open
        assert_eq!(timeouts.sweep().await.unwrap(), 0);
        assert!(store.get_lobby("game", &code).await.unwrap().has_member(&id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(timeouts.sweep().await.unwrap(), 1);

        let lobby = store.get_lobby("game", &code).await.unwrap();
        assert_eq!(lobby.peers, vec!["other".to_string()]);

        let notice: Value = serde_json::from_str(&other.recv().await.unwrap()).unwrap();
        assert_eq!(notice["type"], "disconnect");
        assert_eq!(notice["id"], id);
    }

    #[tokio::test]
    async fn test_failed_resume_is_still_evicted() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_millis(30));
        store
            .create_lobby("game", "BCDF", "other", &LobbySettings::default())
            .await
            .unwrap();
        store.join_lobby("game", "BCDF", "old-id").await.unwrap();
        store
            .record_disconnect(PendingDisconnect {
                game: "game".into(),
                peer_id: "old-id".into(),
                secret: "secret".into(),
                lobby: Some("BCDF".into()),
                disconnected_at: Utc::now(),
            })
            .await
            .unwrap();
        let mut other = store.subscribe(&peer_topic("game", "other")).await.unwrap();

        // The new transport is gone before the welcome goes out
        let (conn, rx) = RecordingConnection::new();
        drop(rx);
        let mut peer = Peer::new(
            store.clone(),
            conn,
            timeouts.clone(),
            PeerSettings::default(),
            CancellationToken::new(),
        );
        let result = peer
            .handle_packet(
                "hello",
                br#"{"type":"hello","game":"game","id":"old-id","secret":"secret"}"#,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(peer.lobby(), Some("BCDF"));
        assert_eq!(store.pending_disconnect_count(), 0);

        timeouts.disconnected(&peer).await;
        assert_eq!(store.pending_disconnect_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(timeouts.sweep().await.unwrap(), 1);

        let lobby = store.get_lobby("game", "BCDF").await.unwrap();
        assert_eq!(lobby.peers, vec!["other".to_string()]);

        let notice: Value = serde_json::from_str(&other.recv().await.unwrap()).unwrap();
        assert_eq!(notice["type"], "disconnect");
        assert_eq!(notice["id"], "old-id");
    }

    #[tokio::test]
    async fn test_expired_claim_is_rejected_and_evicted() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_millis(10));
        store
            .create_lobby("game", "BCDF", "gone", &LobbySettings::default())
            .await
            .unwrap();
        store
            .record_disconnect(PendingDisconnect {
                game: "game".into(),
                peer_id: "gone".into(),
                secret: "secret".into(),
                lobby: Some("BCDF".into()),
                disconnected_at: Utc::now() - chrono::Duration::seconds(5),
            })
            .await
            .unwrap();

        assert!(timeouts.reconnected("game", "gone", "secret").await.is_none());
        assert_eq!(store.lobby_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let timeouts = manager(&store, Duration::from_millis(10));
        store
            .record_disconnect(PendingDisconnect {
                game: "game".into(),
                peer_id: "gone".into(),
                secret: "secret".into(),
                lobby: None,
                disconnected_at: Utc::now() - chrono::Duration::seconds(5),
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(timeouts.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.pending_disconnect_count(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
