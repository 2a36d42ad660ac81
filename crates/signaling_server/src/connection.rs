//! Write half of a peer's transport
//!
//! The read half stays with the handler's read loop. Writers (packet
//! replies, relay forwarding, keepalive) share one [`Connection`], which
//! serializes frames so they never interleave.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use std::borrow::Cow;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tungstenite::error::{Error as WsError, ProtocolError};

use crate::error::ConnectionError;

pub use axum::extract::ws::close_code;

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Write one text frame
    async fn send_text(&self, text: String) -> Result<(), ConnectionError>;

    /// Send a close frame. Only the first call has any effect.
    async fn close(&self, code: u16, reason: &str);

    fn is_closed(&self) -> bool;
}

/// Serialize `packet` and write it as one frame
pub async fn send_packet<P: Serialize + ?Sized>(
    conn: &dyn Connection,
    packet: &P,
) -> Result<(), ConnectionError> {
    let text = serde_json::to_string(packet)?;
    conn.send_text(text).await
}

/// Connection over an upgraded axum WebSocket
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(classify)
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        // The peer may be gone already; nothing to do about it here.
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Map a transport error, singling out "the other side is gone"
fn classify(err: axum::Error) -> ConnectionError {
    if is_pipe_error(&err) {
        ConnectionError::Closed
    } else {
        ConnectionError::WebSocket(err.to_string())
    }
}

pub(crate) fn is_pipe_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_pipe_kind(io_err.kind()) {
                return true;
            }
        }
        if let Some(ws_err) = e.downcast_ref::<WsError>() {
            match ws_err {
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => return true,
                WsError::Io(io_err) if is_pipe_kind(io_err.kind()) => return true,
                _ => {}
            }
        }
        current = e.source();
    }
    false
}

fn is_pipe_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// In-memory connection capturing every frame written to it
    pub struct RecordingConnection {
        tx: mpsc::UnboundedSender<String>,
        closed: AtomicBool,
        pub close_code: parking_lot::Mutex<Option<u16>>,
    }

    impl RecordingConnection {
        pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = std::sync::Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
                close_code: parking_lot::Mutex::new(None),
            });
            (conn, rx)
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            self.tx.send(text).map_err(|_| ConnectionError::Closed)
        }

        async fn close(&self, code: u16, _reason: &str) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                *self.close_code.lock() = Some(code);
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingConnection;
    use super::*;
    use crate::packets::ServerPacket;

    #[test]
    fn test_pipe_error_detection() {
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "write failed");
        assert!(is_pipe_error(&broken));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(is_pipe_error(&reset));

        let other = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert!(!is_pipe_error(&other));
    }

    #[test]
    fn test_pipe_error_detection_through_axum() {
        let closed = axum::Error::new(WsError::ConnectionClosed);
        assert!(is_pipe_error(&closed));
        assert!(classify(closed).is_pipe());

        let already = axum::Error::new(WsError::AlreadyClosed);
        assert!(is_pipe_error(&already));

        let reset = axum::Error::new(WsError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(is_pipe_error(&reset));

        // Mentions "closed" but is a genuine protocol failure
        let protocol = axum::Error::new(WsError::Protocol(
            ProtocolError::ReceivedAfterClosing,
        ));
        assert!(protocol.to_string().to_ascii_lowercase().contains("closed"));
        assert!(!is_pipe_error(&protocol));
        assert!(!classify(protocol).is_pipe());

        let utf8 = axum::Error::new(WsError::Utf8);
        assert!(!is_pipe_error(&utf8));
    }

    #[tokio::test]
    async fn test_send_after_close_is_pipe_error() {
        let (conn, mut rx) = RecordingConnection::new();
        send_packet(conn.as_ref(), &ServerPacket::Ping).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some(r#"{"type":"ping"}"#));

        conn.close(close_code::NORMAL, "bye").await;
        conn.close(close_code::ERROR, "again").await;
        assert_eq!(*conn.close_code.lock(), Some(close_code::NORMAL));

        let err = send_packet(conn.as_ref(), &ServerPacket::Ping).await.unwrap_err();
        assert!(err.is_pipe());
    }
}
