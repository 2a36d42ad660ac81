//! Lobby, identity and pub/sub storage
//!
//! All state shared between peers lives behind [`Store`]. The relay never
//! keeps lobby membership or pending disconnects in its own maps, so the
//! same logic runs on one process ([`MemoryStore`]) or a fleet sharing a
//! database ([`PostgresStore`]).
//!
//! Every mutating operation is atomic per lobby or per peer key. Relay
//! envelopes and lobby notifications are delivered through per-peer topics
//! (see [`peer_topic`]) so the receiving connection may live on another
//! instance.

mod hub;
mod memory;
mod postgres;

pub use hub::{LocalHub, Subscription};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Characters used for lobby codes. No vowels, so codes never spell words.
pub const CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

/// Attempts before [`Store::allocate_lobby`] gives up
pub const MAX_CODE_ATTEMPTS: usize = 64;

/// Collisions tolerated at one code length before codes get longer
const CODE_GROW_EVERY: usize = 16;

/// A live lobby
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lobby {
    pub code: String,
    pub owner: String,
    pub public: bool,
    pub max_players: Option<u32>,
    pub peers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Lobby {
    pub fn has_member(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p == peer_id)
    }

    pub fn is_full(&self) -> bool {
        self.max_players
            .is_some_and(|max| self.peers.len() >= max as usize)
    }
}

/// Options chosen by the lobby creator
#[derive(Debug, Clone, Default)]
pub struct LobbySettings {
    pub public: bool,
    pub max_players: Option<u32>,
}

/// A peer whose transport dropped without a `close` packet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDisconnect {
    pub game: String,
    pub peer_id: String,
    pub secret: String,
    pub lobby: Option<String>,
    pub disconnected_at: DateTime<Utc>,
}

/// Topic a peer's connection listens on, wherever it is connected
pub fn peer_topic(game: &str, peer_id: &str) -> String {
    format!("{game}:{peer_id}")
}

/// Random lobby code of `len` characters from [`CODE_ALPHABET`]
pub fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalize a user-typed lobby code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Create a lobby under `code` with `owner` as its only member.
    /// Fails with [`StoreError::LobbyExists`] when the code is taken.
    async fn create_lobby(
        &self,
        game: &str,
        code: &str,
        owner: &str,
        settings: &LobbySettings,
    ) -> Result<Lobby, StoreError>;

    /// Create a lobby under a fresh random code, retrying on collision.
    async fn allocate_lobby(
        &self,
        game: &str,
        owner: &str,
        settings: &LobbySettings,
        code_length: usize,
    ) -> Result<Lobby, StoreError> {
        for attempt in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(code_length + attempt / CODE_GROW_EVERY);
            match self.create_lobby(game, &code, owner, settings).await {
                Ok(lobby) => return Ok(lobby),
                Err(StoreError::LobbyExists) => {
                    debug!(game = %game, code = %code, attempt, "lobby code collision");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Add `peer_id` to a lobby. Returns the lobby as it is after the join.
    /// Joining a lobby the peer is already in is a no-op.
    async fn join_lobby(&self, game: &str, code: &str, peer_id: &str) -> Result<Lobby, StoreError>;

    /// Remove `peer_id` from a lobby and return the remaining members.
    /// The lobby is deleted once nobody is left.
    async fn leave_lobby(
        &self,
        game: &str,
        code: &str,
        peer_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    async fn get_lobby(&self, game: &str, code: &str) -> Result<Lobby, StoreError>;

    /// Public lobbies of a game
    async fn list_lobbies(&self, game: &str) -> Result<Vec<Lobby>, StoreError>;

    /// Record (or refresh) a pending disconnect
    async fn record_disconnect(&self, record: PendingDisconnect) -> Result<(), StoreError>;

    /// Atomically remove and return the pending disconnect of `peer_id` if
    /// the secret matches. At most one caller ever gets `Some`.
    async fn claim_disconnect(
        &self,
        game: &str,
        peer_id: &str,
        secret: &str,
    ) -> Result<Option<PendingDisconnect>, StoreError>;

    /// Atomically remove and return every record older than `cutoff`
    async fn take_expired_disconnects(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingDisconnect>, StoreError>;

    /// Deliver `payload` to every subscriber of `topic`
    async fn publish(&self, topic: &str, payload: String) -> Result<(), StoreError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;
}
