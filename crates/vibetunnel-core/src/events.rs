//! Session lifecycle events
//!
//! A closed set of event kinds published on a broadcast bus. Consumers
//! subscribe through [`EventBus::subscribe`]; there is no string-name
//! late binding.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUS_DEPTH: usize = 256;

/// Everything the core announces about sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        name: String,
        command: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionExited {
        session_id: String,
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    SessionNameChanged {
        session_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    CommandStarted {
        session_id: String,
        command: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CommandFinished {
        session_id: String,
        command: String,
        exit_code: i32,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Bell {
        session_id: String,
    },
}

/// Broadcast bus for [`SessionEvent`]s. Cheap to clone; lagging receivers
/// miss events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_DEPTH);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.tx.send(event);
    }
}
