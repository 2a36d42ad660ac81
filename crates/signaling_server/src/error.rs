//! Error types for the signaling server
//!
//! Errors fall in three buckets: transport-fatal (the connection is torn
//! down), request-level (answered with an `error` packet, connection stays
//! open) and bookkeeping (logged by background tasks and retried on the
//! next tick).

use thiserror::Error;

/// Errors raised by a [`Store`](crate::stores::Store) implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("lobby not found")]
    LobbyNotFound,

    #[error("lobby already exists")]
    LobbyExists,

    #[error("lobby is full")]
    LobbyFull,

    #[error("no free lobby code after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while writing to a peer's transport
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The other side is already gone. Not worth logging.
    #[error("connection closed")]
    Closed,

    #[error("failed to encode packet: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl ConnectionError {
    /// True for the benign "broken pipe" condition a keepalive write hits
    /// when it races a client-initiated close.
    pub fn is_pipe(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors raised while handling a packet in the peer state machine
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("lobby not found")]
    LobbyNotFound,

    #[error("lobby is full")]
    LobbyFull,

    #[error("peer is already in a lobby")]
    AlreadyInLobby,

    #[error("peer is not in a lobby")]
    NotInLobby,

    #[error("recipient not found")]
    RecipientNotFound,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("peer has not sent hello")]
    NotIdentified,

    #[error("peer already identified")]
    AlreadyIdentified,

    #[error("failed to restore identity: {0}")]
    Identify(StoreError),

    #[error("unknown packet type {0:?}")]
    UnknownPacket(String),

    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl PeerError {
    /// Wire code for errors that are reported back to the sender instead of
    /// closing the connection. `None` means the error is fatal.
    pub fn request_code(&self) -> Option<&'static str> {
        match self {
            Self::LobbyNotFound => Some("lobby-not-found"),
            Self::LobbyFull => Some("lobby-full"),
            Self::AlreadyInLobby => Some("already-in-lobby"),
            Self::NotInLobby => Some("not-in-lobby"),
            Self::RecipientNotFound => Some("recipient-not-found"),
            Self::Store(_) => Some("internal-error"),
            _ => None,
        }
    }
}

impl From<StoreError> for PeerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LobbyNotFound => Self::LobbyNotFound,
            StoreError::LobbyFull => Self::LobbyFull,
            other => Self::Store(other),
        }
    }
}

/// Errors from a [`CredentialsProvider`](crate::credentials::CredentialsProvider)
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("no credentials provider configured")]
    NotConfigured,

    #[error("invalid shared secret")]
    InvalidSecret,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Errors from an [`EventSink`](crate::events::EventSink)
#[derive(Error, Debug)]
pub enum EventError {
    #[error("event rejected: {0}")]
    Rejected(String),
}
