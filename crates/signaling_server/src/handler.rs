//! WebSocket entry point
//!
//! Every upgraded connection gets a read loop, a keepalive task and a
//! [`Peer`]. The loop routes `credentials`, `event` and `pong` itself and
//! hands everything else to the peer. When the loop ends, for whatever
//! reason, the connection is closed and (unless the client said goodbye)
//! the [`TimeoutManager`] starts the reconnect grace window.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{close_code, is_pipe_error, send_packet, Connection, WsConnection};
use crate::credentials::CredentialsProvider;
use crate::error::PeerError;
use crate::events::{Event, EventSink};
use crate::metrics::METRICS;
use crate::packets::{EventPacket, ServerPacket, TypeOnly, RELAY_TYPES};
use crate::peer::{Peer, PeerSettings};
use crate::stores::Store;
use crate::timeout::TimeoutManager;

/// Signaling frames are small; anything bigger is not a handshake
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// How long a connection lingers for the client's close frame after `close`
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Packet types counted under their own label
const KNOWN_TYPES: &[&str] = &[
    "hello",
    "create",
    "join",
    "leave",
    "list",
    "close",
    "credentials",
    "event",
    "pong",
];

/// External collaborators the handler talks to
#[derive(Clone)]
pub struct Dependencies {
    pub store: Arc<dyn Store>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub max_connection_time: Duration,
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub disconnect_timeout: Duration,
    pub peer: PeerSettings,
}

impl From<&Config> for HandlerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_connection_time: config.max_connection_time(),
            ping_interval: config.ping_interval(),
            max_missed_pongs: config.max_missed_pongs,
            disconnect_timeout: config.disconnect_timeout(),
            peer: PeerSettings {
                lobby_code_length: config.lobby_code_length,
                max_lobby_size: config.max_lobby_size,
            },
        }
    }
}

#[derive(Clone)]
struct HandlerState {
    deps: Dependencies,
    timeouts: Arc<TimeoutManager>,
    settings: Arc<HandlerSettings>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Build the signaling routes and start the disconnect sweeper.
///
/// Every connection (and the sweeper) is tracked by the returned
/// [`TaskTracker`]; cancel `cancel`, then `close()` and `wait()` the tracker
/// to drain them.
pub fn handler(cancel: CancellationToken, deps: Dependencies, config: &Config) -> (TaskTracker, Router) {
    let tracker = TaskTracker::new();
    let timeouts = Arc::new(TimeoutManager::new(
        deps.store.clone(),
        config.reconnect_grace(),
        config.sweep_interval(),
    ));

    tracker.spawn(timeouts.clone().run(cancel.clone()));

    let state = HandlerState {
        deps,
        timeouts,
        settings: Arc::new(HandlerSettings::from(config)),
        tracker: tracker.clone(),
        cancel,
    };

    let router = Router::new()
        .route("/v1/signaling", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(state);

    (tracker, router)
}

async fn upgrade(
    State(state): State<HandlerState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "rejected non-websocket request");
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };

    if state.cancel.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            let tracker = state.tracker.clone();
            let span = info_span!(
                "connection",
                conn = %Uuid::new_v4(),
                peer = field::Empty,
                game = field::Empty
            );
            tracker.track_future(serve(socket, state).instrument(span))
        })
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Client sent `close`
    Closed,
    /// Transport ended without a `close` packet
    Dropped,
    TransportError,
    ProtocolError,
    KeepaliveTimeout,
    MaxLifetime,
    Shutdown,
}

impl Exit {
    fn label(self) -> &'static str {
        match self {
            Exit::Closed => "closed",
            Exit::Dropped => "dropped",
            Exit::TransportError => "transport_error",
            Exit::ProtocolError => "protocol_error",
            Exit::KeepaliveTimeout => "keepalive_timeout",
            Exit::MaxLifetime => "max_lifetime",
            Exit::Shutdown => "shutdown",
        }
    }

    fn close_code(self) -> u16 {
        match self {
            Exit::Closed => close_code::NORMAL,
            Exit::ProtocolError => close_code::PROTOCOL,
            Exit::Shutdown => close_code::AWAY,
            _ => close_code::ERROR,
        }
    }
}

async fn serve(socket: WebSocket, state: HandlerState) {
    METRICS.connections_total.inc();
    METRICS.connections_active.inc();
    debug!("connection opened");

    let settings = state.settings.clone();
    let (sink, mut stream) = socket.split();
    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(sink));
    let cancel = state.cancel.child_token();
    let last_seen = Arc::new(parking_lot::Mutex::new(Instant::now()));

    let mut peer = Peer::new(
        state.deps.store.clone(),
        conn.clone(),
        state.timeouts.clone(),
        settings.peer.clone(),
        cancel.clone(),
    );

    let mut keepalive = tokio::spawn(
        keepalive(
            conn.clone(),
            last_seen.clone(),
            settings.ping_interval,
            settings.max_missed_pongs,
        )
        .instrument(tracing::Span::current()),
    );

    let exit = tokio::select! {
        exit = read_loop(&mut stream, &mut peer, &state, &last_seen) => exit,
        exit = &mut keepalive => exit.unwrap_or(Exit::TransportError),
        _ = tokio::time::sleep(settings.max_connection_time) => Exit::MaxLifetime,
        _ = cancel.cancelled() => Exit::Shutdown,
    };

    cancel.cancel();
    keepalive.abort();

    if !peer.closed_packet_received() {
        conn.close(exit.close_code(), exit.label()).await;
    }

    METRICS.connections_closed.with_label_values(&[exit.label()]).inc();
    METRICS.connections_active.dec();
    info!(reason = exit.label(), state = ?peer.state(), "connection closed");

    // Runs on its own budget; the connection's token is already cancelled
    if tokio::time::timeout(settings.disconnect_timeout, state.timeouts.disconnected(&peer))
        .await
        .is_err()
    {
        warn!("disconnect bookkeeping timed out");
    }
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    peer: &mut Peer,
    state: &HandlerState,
    last_seen: &parking_lot::Mutex<Instant>,
) -> Exit {
    loop {
        let next = if peer.closed_packet_received() {
            match tokio::time::timeout(CLOSE_LINGER, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Exit::Closed,
            }
        } else {
            stream.next().await
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                if is_pipe_error(&e) {
                    debug!(error = %e, "transport closed");
                    return closed_or(peer, Exit::Dropped);
                }
                warn!(error = %e, "read failed");
                return closed_or(peer, Exit::TransportError);
            }
            None => return closed_or(peer, Exit::Dropped),
        };

        *last_seen.lock() = Instant::now();

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(frame = ?frame, "client sent close frame");
                return closed_or(peer, Exit::Dropped);
            }
            Message::Binary(_) => {
                warn!("binary frames are not part of the protocol");
                return Exit::ProtocolError;
            }
        };

        if peer.closed_packet_received() {
            debug!(len = text.len(), "dropping packet received after close");
            continue;
        }

        if let Err(e) = handle_text(state, peer, &text).await {
            if let PeerError::Connection(err) = &e {
                if err.is_pipe() {
                    debug!("connection gone while replying");
                    return Exit::Dropped;
                }
                warn!(error = %err, "write failed");
                return Exit::TransportError;
            }
            warn!(error = %e, "protocol violation, dropping connection");
            return Exit::ProtocolError;
        }
    }
}

fn closed_or(peer: &Peer, exit: Exit) -> Exit {
    if peer.closed_packet_received() {
        Exit::Closed
    } else {
        exit
    }
}

async fn handle_text(state: &HandlerState, peer: &mut Peer, text: &str) -> Result<(), PeerError> {
    let TypeOnly { kind } = serde_json::from_str(text)?;
    METRICS
        .packets_received
        .with_label_values(&[packet_label(&kind)])
        .inc();

    match kind.as_str() {
        "credentials" => handle_credentials(state, peer).await,
        "event" => handle_event(state, peer, serde_json::from_str(text)?),
        "pong" => Ok(()),
        _ => peer.handle_packet(&kind, text.as_bytes()).await,
    }
}

fn packet_label(kind: &str) -> &str {
    if KNOWN_TYPES.contains(&kind) || RELAY_TYPES.contains(&kind) {
        kind
    } else {
        "unknown"
    }
}

async fn handle_credentials(state: &HandlerState, peer: &Peer) -> Result<(), PeerError> {
    match state.deps.credentials.get_credentials().await {
        Ok(credentials) => {
            METRICS
                .credentials_requests
                .with_label_values(&["issued"])
                .inc();
            peer.send(&ServerPacket::Credentials { credentials }).await?;
        }
        Err(e) => {
            METRICS
                .credentials_requests
                .with_label_values(&["failed"])
                .inc();
            warn!(error = %e, "failed to get credentials");
            peer.send(&ServerPacket::error("credentials-unavailable", e.to_string()))
                .await?;
        }
    }
    Ok(())
}

fn handle_event(state: &HandlerState, peer: &Peer, packet: EventPacket) -> Result<(), PeerError> {
    let event = Event {
        game: peer.identity().map(|i| i.game.clone()),
        peer: peer.id().map(str::to_string),
        lobby: peer.lobby().map(str::to_string),
        category: packet.category,
        action: packet.action,
        data: packet.data,
    };

    let sink = state.deps.events.clone();
    state.tracker.spawn(
        async move {
            if let Err(e) = sink.record_event(event).await {
                debug!(error = %e, "client event dropped");
            }
        }
        .instrument(tracing::Span::current()),
    );
    Ok(())
}

/// Ping on every tick; give up once nothing was heard for
/// `max_missed` intervals.
async fn keepalive(
    conn: Arc<dyn Connection>,
    last_seen: Arc<parking_lot::Mutex<Instant>>,
    every: Duration,
    max_missed: u32,
) -> Exit {
    let limit = every * max_missed;
    let mut ticker = interval_at(Instant::now() + every, every);

    loop {
        ticker.tick().await;

        let idle = last_seen.lock().elapsed();
        if idle >= limit {
            info!(idle_secs = idle.as_secs(), "keepalive timed out");
            return Exit::KeepaliveTimeout;
        }

        if let Err(e) = send_packet(conn.as_ref(), &ServerPacket::Ping).await {
            if e.is_pipe() {
                debug!("keepalive stopped, connection gone");
                return Exit::Dropped;
            }
            warn!(error = %e, "failed to send ping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingConnection;

    #[test]
    fn test_exit_close_codes() {
        assert_eq!(Exit::Closed.close_code(), close_code::NORMAL);
        assert_eq!(Exit::ProtocolError.close_code(), close_code::PROTOCOL);
        assert_eq!(Exit::Shutdown.close_code(), close_code::AWAY);
        assert_eq!(Exit::Dropped.close_code(), close_code::ERROR);
    }

    #[test]
    fn test_packet_labels_are_bounded() {
        assert_eq!(packet_label("hello"), "hello");
        assert_eq!(packet_label("candidate"), "candidate");
        assert_eq!(packet_label("x-custom-thing"), "unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_while_peer_answers() {
        let (conn, mut rx) = RecordingConnection::new();
        let last_seen = Arc::new(parking_lot::Mutex::new(Instant::now()));
        let every = Duration::from_secs(30);

        let task = tokio::spawn(keepalive(conn, last_seen.clone(), every, 2));

        for _ in 0..5 {
            tokio::time::sleep(every).await;
            *last_seen.lock() = Instant::now();
            assert_eq!(rx.recv().await.as_deref(), Some(r#"{"type":"ping"}"#));
        }
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_times_out_silent_peer() {
        let (conn, _rx) = RecordingConnection::new();
        let last_seen = Arc::new(parking_lot::Mutex::new(Instant::now()));

        let exit = keepalive(conn, last_seen, Duration::from_secs(30), 3).await;
        assert_eq!(exit, Exit::KeepaliveTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_when_connection_closes() {
        let (conn, _rx) = RecordingConnection::new();
        conn.close(close_code::NORMAL, "bye").await;
        let last_seen = Arc::new(parking_lot::Mutex::new(Instant::now()));

        let exit = keepalive(conn, last_seen, Duration::from_secs(30), 3).await;
        assert_eq!(exit, Exit::Dropped);
    }
}
