//! # Pulsar Signaling - WebRTC lobby and handshake relay
//!
//! Brokers the handshake that lets game clients open direct peer-to-peer
//! data channels. The relay never carries application traffic.
//!
//! ## Features
//!
//! - **Lobbies** - Create, join, leave and list lobbies with short codes
//! - **Handshake relay** - SDP / ICE envelopes forwarded between lobby members
//! - **Reconnect grace** - Abruptly dropped peers keep their seat for a while
//! - **TURN credentials** - Shared-secret or Cloudflare issued ICE servers
//! - **Client events** - Telemetry forwarded to a pluggable sink
//! - **Shared state** - In-memory or PostgreSQL store, so instances can scale out
//! - **Metrics** - Prometheus metrics for observability
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (in-memory store)
//! cargo run --bin pulsar-signaling
//!
//! # Shared PostgreSQL store and TURN credentials
//! cargo run --bin pulsar-signaling -- \
//!     --database-url postgres://localhost/signaling \
//!     --turn-urls turn:turn.example.com:3478 --turn-secret s3cret
//! ```
//!
//! ## Module Overview
//!
//! - [`handler`] - WebSocket entry point and per-connection read loop
//! - [`peer`] - Per-connection signaling state machine
//! - [`timeout`] - Reconnect grace window and eviction sweep
//! - [`stores`] - Lobby / identity / pub-sub storage
//! - [`credentials`] - TURN credential providers
//! - [`events`] - Client telemetry sink
//! - [`http_server`] - Router, health and metrics endpoints
//! - [`config`] - Configuration management
//! - [`logging`] - Pretty logging with colors

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod handler;
pub mod http_server;
pub mod logging;
pub mod metrics;
pub mod packets;
pub mod peer;
pub mod shutdown;
pub mod stores;
pub mod timeout;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credentials, CredentialsProvider};
pub use error::{ConnectionError, CredentialsError, EventError, PeerError, StoreError};
pub use events::{Event, EventSink, LogEventSink};
pub use handler::{handler, Dependencies};
pub use metrics::METRICS;
pub use peer::{Peer, PeerState};
pub use shutdown::ShutdownCoordinator;
pub use stores::{Lobby, MemoryStore, PostgresStore, Store};
pub use timeout::TimeoutManager;
