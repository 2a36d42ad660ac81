//! Signaling state machine for one connection
//!
//! ```text
//! Unidentified --hello--> Identified --create--> LobbyOwner
//!                              |    \--join----> LobbyMember
//!                              |          (leave returns to Identified)
//!                              \--close (any state)--> Closed
//! ```
//!
//! Everything the peer shares with others goes through the [`Store`]:
//! lobby membership, and the per-peer topics that carry relay envelopes
//! and lobby notifications. A forwarding task drains this peer's topic
//! into its [`Connection`].

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::connection::{close_code, send_packet, Connection};
use crate::error::{ConnectionError, PeerError, StoreError};
use crate::metrics::METRICS;
use crate::packets::{
    ClosePacket, CreatePacket, HelloPacket, JoinPacket, RelayPacket, ServerPacket, RELAY_TYPES,
};
use crate::stores::{
    normalize_code, peer_topic, Lobby, LobbySettings, PendingDisconnect, Store, Subscription,
};

const SECRET_LENGTH: usize = 32;

/// Identity restoration capability handed to every peer
///
/// Returns the pending-disconnect record when `peer_id` may be resumed; the
/// record is consumed by the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReconnectHook: Send + Sync + 'static {
    async fn reconnected(&self, game: &str, peer_id: &str, secret: &str) -> Option<PendingDisconnect>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Unidentified,
    Identified,
    LobbyOwner { code: String },
    LobbyMember { code: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub game: String,
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub lobby_code_length: usize,
    pub max_lobby_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            lobby_code_length: 4,
            max_lobby_size: 64,
        }
    }
}

pub struct Peer {
    store: Arc<dyn Store>,
    conn: Arc<dyn Connection>,
    reconnect: Arc<dyn ReconnectHook>,
    settings: PeerSettings,
    /// Lifetime of the underlying connection; stops the forwarding task
    cancel: CancellationToken,
    identity: Option<Identity>,
    state: PeerState,
    /// Lobby held when a graceful close arrived
    closed_in: Option<String>,
}

impl Peer {
    pub fn new(
        store: Arc<dyn Store>,
        conn: Arc<dyn Connection>,
        reconnect: Arc<dyn ReconnectHook>,
        settings: PeerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            conn,
            reconnect,
            settings,
            cancel,
            identity: None,
            state: PeerState::Unidentified,
            closed_in: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn lobby(&self) -> Option<&str> {
        match &self.state {
            PeerState::LobbyOwner { code } | PeerState::LobbyMember { code } => Some(code.as_str()),
            PeerState::Closed => self.closed_in.as_deref(),
            _ => None,
        }
    }

    /// True once the client said goodbye with a `close` packet
    pub fn closed_packet_received(&self) -> bool {
        self.state == PeerState::Closed
    }

    pub async fn send(&self, packet: &ServerPacket) -> Result<(), ConnectionError> {
        send_packet(self.conn.as_ref(), packet).await
    }

    /// Handle one inbound packet. Request-level failures are answered with
    /// an `error` packet; an `Err` means the connection must be dropped.
    pub async fn handle_packet(&mut self, kind: &str, raw: &[u8]) -> Result<(), PeerError> {
        match self.dispatch(kind, raw).await {
            Ok(()) => Ok(()),
            Err(err) => match err.request_code() {
                Some(code) => {
                    debug!(peer = ?self.id(), packet = %kind, error = %err, "request failed");
                    self.send(&ServerPacket::error(code, err.to_string())).await?;
                    Ok(())
                }
                None => Err(err),
            },
        }
    }

    async fn dispatch(&mut self, kind: &str, raw: &[u8]) -> Result<(), PeerError> {
        match kind {
            "hello" => return self.handle_hello(serde_json::from_slice(raw)?).await,
            "close" => return self.handle_close(serde_json::from_slice(raw)?).await,
            _ => {}
        }

        let identity = self.identity.clone().ok_or(PeerError::NotIdentified)?;

        match kind {
            "create" => self.handle_create(&identity, serde_json::from_slice(raw)?).await,
            "join" => self.handle_join(&identity, serde_json::from_slice(raw)?).await,
            "leave" => self.handle_leave(&identity).await,
            "list" => self.handle_list(&identity).await,
            k if RELAY_TYPES.contains(&k) => {
                self.handle_relay(&identity, serde_json::from_slice(raw)?).await
            }
            other => Err(PeerError::UnknownPacket(other.to_string())),
        }
    }

    async fn handle_hello(&mut self, hello: HelloPacket) -> Result<(), PeerError> {
        if self.identity.is_some() {
            return Err(PeerError::AlreadyIdentified);
        }

        let restored = match (&hello.id, &hello.secret) {
            (Some(id), Some(secret)) => self.reconnect.reconnected(&hello.game, id, secret).await,
            _ => None,
        };

        let (identity, lobby) = match restored {
            Some(record) => {
                METRICS.reconnects.with_label_values(&["restored"]).inc();
                let identity = Identity {
                    game: record.game,
                    id: record.peer_id,
                    secret: record.secret,
                };
                (identity, record.lobby)
            }
            None => {
                if hello.id.is_some() {
                    METRICS.reconnects.with_label_values(&["expired"]).inc();
                }
                let identity = Identity {
                    game: hello.game,
                    id: Uuid::new_v4().to_string(),
                    secret: generate_secret(),
                };
                (identity, None)
            }
        };

        // A restored peer still holds its seat in the store; track it before any I/O
        self.identity = Some(identity.clone());
        self.state = match &lobby {
            Some(code) => PeerState::LobbyMember { code: code.clone() },
            None => PeerState::Identified,
        };

        let span = tracing::Span::current();
        span.record("peer", identity.id.as_str());
        span.record("game", identity.game.as_str());

        info!(
            peer = %identity.id,
            game = %identity.game,
            restored = hello.id.as_deref() == Some(identity.id.as_str()),
            "peer identified"
        );

        // Listen before announcing anything so nothing addressed to us is lost
        let subscription = self
            .store
            .subscribe(&peer_topic(&identity.game, &identity.id))
            .await
            .map_err(PeerError::Identify)?;
        self.spawn_forwarder(subscription);

        self.send(&ServerPacket::Welcome {
            id: identity.id.clone(),
            secret: identity.secret.clone(),
        })
        .await?;

        if let Some(code) = lobby {
            self.restore_lobby(&identity, &code).await?;
        }

        Ok(())
    }

    /// Resume membership kept alive during the grace window. Other members
    /// are not notified; from their side the peer never left.
    async fn restore_lobby(&mut self, identity: &Identity, code: &str) -> Result<(), PeerError> {
        match self.store.get_lobby(&identity.game, code).await {
            Ok(lobby) if lobby.has_member(&identity.id) => {
                self.state = membership_state(&lobby, &identity.id);
                info!(peer = %identity.id, lobby = %code, "lobby membership restored");
                self.send(&ServerPacket::Joined { lobby }).await?;
            }
            Ok(_) | Err(StoreError::LobbyNotFound) => {
                self.state = PeerState::Identified;
                info!(peer = %identity.id, lobby = %code, "lobby gone before reconnect");
            }
            Err(e) => {
                // Keep the seat so a later leave or sweep releases it
                warn!(peer = %identity.id, lobby = %code, error = %e, "failed to restore lobby");
            }
        }
        Ok(())
    }

    async fn handle_create(&mut self, identity: &Identity, create: CreatePacket) -> Result<(), PeerError> {
        if self.lobby().is_some() {
            return Err(PeerError::AlreadyInLobby);
        }

        let max = self.settings.max_lobby_size;
        let settings = LobbySettings {
            public: create.public,
            max_players: Some(create.max_players.map_or(max, |m| m.clamp(1, max.max(1)))),
        };

        let lobby = self
            .store
            .allocate_lobby(
                &identity.game,
                &identity.id,
                &settings,
                self.settings.lobby_code_length,
            )
            .await?;

        METRICS.lobbies_created.inc();
        info!(peer = %identity.id, lobby = %lobby.code, public = lobby.public, "lobby created");

        self.state = PeerState::LobbyOwner {
            code: lobby.code.clone(),
        };
        self.send(&ServerPacket::Joined { lobby }).await?;
        Ok(())
    }

    async fn handle_join(&mut self, identity: &Identity, join: JoinPacket) -> Result<(), PeerError> {
        if self.lobby().is_some() {
            return Err(PeerError::AlreadyInLobby);
        }

        let code = normalize_code(&join.lobby);
        let lobby = match self.store.join_lobby(&identity.game, &code, &identity.id).await {
            Ok(lobby) => lobby,
            Err(e) => {
                let result = match e {
                    StoreError::LobbyNotFound => "not_found",
                    StoreError::LobbyFull => "full",
                    _ => "error",
                };
                METRICS.lobby_joins.with_label_values(&[result]).inc();
                return Err(e.into());
            }
        };

        METRICS.lobby_joins.with_label_values(&["joined"]).inc();
        info!(peer = %identity.id, lobby = %code, members = lobby.peers.len(), "peer joined lobby");

        self.state = membership_state(&lobby, &identity.id);
        let others: Vec<String> = lobby
            .peers
            .iter()
            .filter(|p| **p != identity.id)
            .cloned()
            .collect();

        self.send(&ServerPacket::Joined { lobby }).await?;
        notify(
            self.store.as_ref(),
            &identity.game,
            &others,
            &ServerPacket::Connect {
                id: identity.id.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn handle_leave(&mut self, identity: &Identity) -> Result<(), PeerError> {
        let code = self.lobby().ok_or(PeerError::NotInLobby)?.to_string();
        self.state = PeerState::Identified;
        leave_and_notify(self.store.as_ref(), &identity.game, &code, &identity.id).await?;
        Ok(())
    }

    async fn handle_list(&mut self, identity: &Identity) -> Result<(), PeerError> {
        let lobbies = self.store.list_lobbies(&identity.game).await?;
        self.send(&ServerPacket::Lobbies { lobbies }).await?;
        Ok(())
    }

    async fn handle_relay(&mut self, identity: &Identity, mut packet: RelayPacket) -> Result<(), PeerError> {
        let code = self.lobby().ok_or(PeerError::NotInLobby)?;

        let lobby = match self.store.get_lobby(&identity.game, code).await {
            Ok(lobby) => lobby,
            Err(StoreError::LobbyNotFound) => return Err(PeerError::RecipientNotFound),
            Err(e) => return Err(e.into()),
        };

        if packet.recipient == identity.id || !lobby.has_member(&packet.recipient) {
            METRICS.relays_total.with_label_values(&["not_found"]).inc();
            return Err(PeerError::RecipientNotFound);
        }

        packet.source = Some(identity.id.clone());
        let payload = serde_json::to_string(&packet)?;
        self.store
            .publish(&peer_topic(&identity.game, &packet.recipient), payload)
            .await?;

        METRICS.relays_total.with_label_values(&["delivered"]).inc();
        debug!(
            peer = %identity.id,
            recipient = %packet.recipient,
            packet = %packet.kind,
            "relayed handshake envelope"
        );
        Ok(())
    }

    async fn handle_close(&mut self, close: ClosePacket) -> Result<(), PeerError> {
        let reason = close.reason.unwrap_or_else(|| "normal closure".to_string());

        if let Some(identity) = self.identity.clone() {
            if let Some(code) = self.lobby().map(str::to_string) {
                if let Err(e) =
                    leave_and_notify(self.store.as_ref(), &identity.game, &code, &identity.id).await
                {
                    warn!(peer = %identity.id, lobby = %code, error = %e, "failed to leave lobby on close");
                }
                self.closed_in = Some(code);
            }
        }

        info!(peer = ?self.id(), reason = %reason, "peer sent close");
        self.state = PeerState::Closed;
        self.conn.close(close_code::NORMAL, &reason).await;
        Ok(())
    }

    fn spawn_forwarder(&self, mut subscription: Subscription) {
        let conn = self.conn.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = subscription.recv() => {
                            let Some(text) = message else { break };
                            if let Err(e) = conn.send_text(text).await {
                                if !e.is_pipe() {
                                    warn!(topic = %subscription.topic(), error = %e, "failed to forward packet");
                                }
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }
}

fn membership_state(lobby: &Lobby, peer_id: &str) -> PeerState {
    if lobby.owner == peer_id {
        PeerState::LobbyOwner {
            code: lobby.code.clone(),
        }
    } else {
        PeerState::LobbyMember {
            code: lobby.code.clone(),
        }
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

/// Deliver `packet` to each peer's topic. Failures are logged per peer.
pub(crate) async fn notify(store: &dyn Store, game: &str, peers: &[String], packet: &ServerPacket) {
    let payload = match serde_json::to_string(packet) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode notification");
            return;
        }
    };

    for peer in peers {
        if let Err(e) = store.publish(&peer_topic(game, peer), payload.clone()).await {
            warn!(peer = %peer, error = %e, "failed to notify peer");
        }
    }
}

/// Remove `peer_id` from its lobby and tell whoever is left
pub(crate) async fn leave_and_notify(
    store: &dyn Store,
    game: &str,
    code: &str,
    peer_id: &str,
) -> Result<(), StoreError> {
    let remaining = match store.leave_lobby(game, code, peer_id).await {
        Ok(remaining) => remaining,
        Err(StoreError::LobbyNotFound) => return Ok(()),
        Err(e) => return Err(e),
    };

    info!(peer = %peer_id, lobby = %code, remaining = remaining.len(), "peer left lobby");
    notify(
        store,
        game,
        &remaining,
        &ServerPacket::Disconnect {
            id: peer_id.to_string(),
        },
    )
    .await;
    Ok(())
}
