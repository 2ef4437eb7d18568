//! Coordination between contexts sharing one local store.
//!
//! Each context registers itself in a shared registry and refreshes the entry
//! on a heartbeat. Note changes are announced over a [`BroadcastChannel`];
//! the storage-backed channel writes a message to a notification key and
//! deletes it again, and the write is what other contexts observe.
//!
//! `safe_update` serializes read-modify-write cycles inside this process only.
//! Two processes can still interleave between the read and the write, so the
//! guard narrows the race window without closing it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::storage::{get_json, keys, set_json, Note, NoteId, SharedLocalStore, StorageError};

use super::config::TabConfig;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Update of {0} rejected by validator")]
    ValidationRejected(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Coordinator lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// One live context in the shared registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabRegistration {
    pub context_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

type Registry = BTreeMap<String, TabRegistration>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Change announcement exchanged between contexts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub note_id: NoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
    pub origin_context_id: String,
    /// Milliseconds since the epoch, strictly increasing per sender
    pub timestamp: i64,
}

/// Transport for change announcements between contexts.
///
/// Every subscriber sees every posted message, including its own.
pub trait BroadcastChannel: Send + Sync {
    fn post(&self, message: &BroadcastMessage) -> Result<()>;

    fn subscribe(&self) -> BoxStream<'static, BroadcastMessage>;
}

/// Broadcast over the shared local store's change notifications
pub struct StorageBroadcastChannel {
    store: SharedLocalStore,
}

impl StorageBroadcastChannel {
    pub fn new(store: SharedLocalStore) -> Self {
        Self { store }
    }
}

impl BroadcastChannel for StorageBroadcastChannel {
    fn post(&self, message: &BroadcastMessage) -> Result<()> {
        self.store.set(keys::NOTIFY, serde_json::to_value(message)?)?;
        self.store.remove(keys::NOTIFY)?;
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, BroadcastMessage> {
        let changes = self.store.subscribe();
        stream::unfold(changes, |mut changes| async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == keys::NOTIFY => {
                        // The follow-up removal carries no value
                        let Some(value) = change.new_value else {
                            continue;
                        };
                        match serde_json::from_value::<BroadcastMessage>(value) {
                            Ok(message) => return Some((message, changes)),
                            Err(e) => log::debug!("Coordinator: ignoring malformed broadcast: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Coordinator: missed {} storage notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Random identity for one running context
pub fn generate_context_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("ctx-{}", suffix)
}

pub struct Coordinator {
    store: SharedLocalStore,
    channel: Arc<dyn BroadcastChannel>,
    context_id: String,
    config: TabConfig,
    /// Last timestamp this context sent
    last_sent: Mutex<i64>,
    /// Watermark of the newest broadcast accepted from another context
    last_processed: Mutex<i64>,
    /// In-process advisory lock for `safe_update`
    update_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(store: SharedLocalStore, channel: Arc<dyn BroadcastChannel>, config: TabConfig) -> Self {
        Self::with_context_id(store, channel, config, generate_context_id())
    }

    pub fn with_context_id(
        store: SharedLocalStore,
        channel: Arc<dyn BroadcastChannel>,
        config: TabConfig,
        context_id: String,
    ) -> Self {
        Self {
            store,
            channel,
            context_id,
            config,
            last_sent: Mutex::new(0),
            last_processed: Mutex::new(0),
            update_lock: Mutex::new(()),
        }
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    fn liveness_window(&self) -> Duration {
        self.config.liveness_window()
    }

    // ===== Registry =====

    pub fn register(&self, now: DateTime<Utc>) -> Result<()> {
        let window = self.liveness_window();
        let context_id = self.context_id.clone();
        self.safe_update(keys::TABS, |mut registry: Registry| {
            registry.retain(|_, tab| now - tab.last_activity <= window);
            registry.insert(
                context_id.clone(),
                TabRegistration {
                    context_id,
                    registered_at: now,
                    last_activity: now,
                },
            );
            (registry, ())
        })?;
        log::info!("Coordinator: registered context {}", self.context_id);
        Ok(())
    }

    /// Refresh this context's registration and prune inactive ones.
    /// Returns how many registrations were pruned.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = self.liveness_window();
        let context_id = self.context_id.clone();
        let pruned = self.safe_update(keys::TABS, |mut registry: Registry| {
            let before = registry.len();
            registry.retain(|id, tab| *id == context_id || now - tab.last_activity <= window);
            let pruned = before - registry.len();

            registry
                .entry(context_id.clone())
                .and_modify(|tab| tab.last_activity = now)
                .or_insert_with(|| TabRegistration {
                    context_id: context_id.clone(),
                    registered_at: now,
                    last_activity: now,
                });
            (registry, pruned)
        })?;
        if pruned > 0 {
            log::debug!("Coordinator: pruned {} inactive contexts", pruned);
        }
        Ok(pruned)
    }

    pub fn unregister(&self) -> Result<()> {
        let context_id = self.context_id.clone();
        self.safe_update(keys::TABS, |mut registry: Registry| {
            registry.remove(&context_id);
            (registry, ())
        })?;
        log::info!("Coordinator: unregistered context {}", self.context_id);
        Ok(())
    }

    /// Registrations active within the liveness window, this context included
    pub fn active_tabs(&self, now: DateTime<Utc>) -> Result<Vec<TabRegistration>> {
        let registry: Registry = get_json(self.store.as_ref(), keys::TABS)?.unwrap_or_default();
        let window = self.liveness_window();
        Ok(registry
            .into_values()
            .filter(|tab| now - tab.last_activity <= window)
            .collect())
    }

    /// Advisory: another context may be writing the same keys right now.
    pub fn has_other_active_tabs(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .active_tabs(now)?
            .iter()
            .any(|tab| tab.context_id != self.context_id))
    }

    // ===== Broadcast =====

    /// Announce a note change to other contexts.
    pub fn broadcast(&self, kind: ChangeKind, note_id: NoteId, note: Option<&Note>) -> Result<BroadcastMessage> {
        self.broadcast_at(kind, note_id, note, Utc::now())
    }

    pub fn broadcast_at(
        &self,
        kind: ChangeKind,
        note_id: NoteId,
        note: Option<&Note>,
        now: DateTime<Utc>,
    ) -> Result<BroadcastMessage> {
        let timestamp = {
            let mut last = self.last_sent.lock().map_err(|_| CoordinatorError::LockPoisoned)?;
            let ts = now.timestamp_millis().max(*last + 1);
            *last = ts;
            ts
        };

        let message = BroadcastMessage {
            kind,
            note_id,
            note: note.cloned(),
            origin_context_id: self.context_id.clone(),
            timestamp,
        };
        self.channel.post(&message)?;
        log::debug!("Coordinator: broadcast {:?} for note {}", kind, note_id);
        Ok(message)
    }

    /// Every message posted on the channel, unfiltered
    pub fn subscribe(&self) -> BoxStream<'static, BroadcastMessage> {
        self.channel.subscribe()
    }

    /// Decide whether a received message should be acted on.
    ///
    /// Own messages and messages not newer than the watermark are dropped.
    /// Accepting a message advances the watermark.
    pub fn accept(&self, message: &BroadcastMessage) -> bool {
        if message.origin_context_id == self.context_id {
            return false;
        }
        let Ok(mut last) = self.last_processed.lock() else {
            return false;
        };
        if message.timestamp <= *last {
            log::debug!(
                "Coordinator: dropping stale broadcast for note {} ({} <= {})",
                message.note_id,
                message.timestamp,
                *last,
            );
            return false;
        }
        *last = message.timestamp;
        true
    }

    /// Newest broadcast timestamp accepted so far
    pub fn watermark(&self) -> i64 {
        self.last_processed.lock().map(|last| *last).unwrap_or_default()
    }

    // ===== Guarded read-modify-write =====

    /// get, update, set under the in-process advisory lock. The updater
    /// returns the new value and a result passed back to the caller.
    pub fn safe_update<T, R, F>(&self, key: &str, updater: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(T) -> (T, R),
    {
        self.safe_update_validated(key, updater, |_| true)
    }

    /// Like `safe_update`, but nothing is written when `validator` rejects
    /// the updated value.
    pub fn safe_update_validated<T, R, F, V>(&self, key: &str, updater: F, validator: V) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(T) -> (T, R),
        V: FnOnce(&T) -> bool,
    {
        let _guard = self.update_lock.lock().map_err(|_| CoordinatorError::LockPoisoned)?;

        let current: T = get_json(self.store.as_ref(), key)?.unwrap_or_default();
        let (updated, out) = updater(current);
        if !validator(&updated) {
            log::warn!("Coordinator: update of {} rejected by validator", key);
            return Err(CoordinatorError::ValidationRejected(key.to_string()));
        }
        set_json(self.store.as_ref(), key, &updated)?;
        Ok(out)
    }
}
