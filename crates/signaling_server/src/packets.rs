//! Wire envelopes
//!
//! Every frame is a JSON object with a `type` field. The handler decodes
//! [`TypeOnly`] first and only parses the full body inside the branch that
//! owns that type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::Credentials;
use crate::stores::Lobby;

/// First-phase decode: just the packet type
#[derive(Debug, Deserialize)]
pub struct TypeOnly {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Identity claim. `id` and `secret` are only present on reconnect.
#[derive(Debug, Deserialize)]
pub struct HelloPacket {
    pub game: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreatePacket {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub max_players: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct JoinPacket {
    pub lobby: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClosePacket {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Client telemetry. Everything besides `category` and `action` is opaque.
#[derive(Debug, Deserialize)]
pub struct EventPacket {
    pub category: String,
    pub action: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Handshake material addressed to one peer (`candidate`, `description`).
///
/// Fields other than `type`, `recipient` and `source` pass through untouched.
/// `source` is always stamped by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPacket {
    #[serde(rename = "type")]
    pub kind: String,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Packet types forwarded peer to peer
pub const RELAY_TYPES: &[&str] = &["candidate", "description"];

/// Everything the server originates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPacket {
    Welcome { id: String, secret: String },
    Joined { lobby: Lobby },
    /// A peer joined the lobby
    Connect { id: String },
    /// A peer left the lobby
    Disconnect { id: String },
    Lobbies { lobbies: Vec<Lobby> },
    Credentials { credentials: Credentials },
    Ping,
    Error { code: String, message: String },
}

impl ServerPacket {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
