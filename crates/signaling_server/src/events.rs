//! Client telemetry sink
//!
//! Clients report `event` packets (connection attempts, failures, timings).
//! The handler hands them to an [`EventSink`] on a spawned task and never
//! waits for the outcome.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::EventError;
use crate::metrics::METRICS;

/// A client event stamped with what the relay knows about the sender
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub game: Option<String>,
    pub peer: Option<String>,
    pub lobby: Option<String>,
    pub category: String,
    pub action: String,
    pub data: Map<String, Value>,
}

#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn record_event(&self, event: Event) -> Result<(), EventError>;
}

/// Writes events to the structured log on target `signaling::events`
pub struct LogEventSink;

/// Keeps client-chosen categories from blowing up metric cardinality
fn metric_category(category: &str) -> &str {
    let well_formed = category.len() <= 32
        && category
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        category
    } else {
        "other"
    }
}

#[async_trait]
impl EventSink for LogEventSink {
    async fn record_event(&self, event: Event) -> Result<(), EventError> {
        if event.category.is_empty() || event.action.is_empty() {
            return Err(EventError::Rejected("category and action are required".into()));
        }

        METRICS
            .events_total
            .with_label_values(&[metric_category(&event.category)])
            .inc();

        tracing::info!(
            target: "signaling::events",
            game = event.game.as_deref().unwrap_or(""),
            peer = event.peer.as_deref().unwrap_or(""),
            lobby = event.lobby.as_deref().unwrap_or(""),
            category = %event.category,
            action = %event.action,
            data = %serde_json::Value::Object(event.data),
            "client event"
        );

        Ok(())
    }
}
