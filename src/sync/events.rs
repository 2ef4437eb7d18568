use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::storage::{Note, NoteId};

use super::queue::QueuedOperation;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Warning,
    Critical,
}

/// Events surfaced to the UI layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    StorageWarning { level: WarningLevel, usage_ratio: f64 },
    #[serde(rename_all = "camelCase")]
    CrashDetected {
        has_backups: bool,
        last_heartbeat: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    EditConflict {
        note_id: NoteId,
        external_note: Note,
        local_content: String,
    },
    #[serde(rename_all = "camelCase")]
    NetworkReconnected {
        offline_duration_ms: u64,
        queued_operations: usize,
    },
    #[serde(rename_all = "camelCase")]
    NetworkDisconnected { timestamp: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    SyncOperationFailed { operation: QueuedOperation },
}

impl SyncEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::StorageWarning { .. } => "storage-warning",
            SyncEvent::CrashDetected { .. } => "crash-detected",
            SyncEvent::EditConflict { .. } => "edit-conflict",
            SyncEvent::NetworkReconnected { .. } => "network-reconnected",
            SyncEvent::NetworkDisconnected { .. } => "network-disconnected",
            SyncEvent::SyncOperationFailed { .. } => "sync-operation-failed",
        }
    }
}

/// Fan-out of `SyncEvent`s to any number of listeners. Cloning shares the
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        log::debug!("Event: {}", event.name());
        // Nobody listening is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
