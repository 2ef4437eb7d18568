#![allow(dead_code)]

use std::sync::Arc;

use nous_sync::sync::{ConflictStrategy, SyncConfig, SyncEvent};
use nous_sync::{MemoryRemote, MemoryStore, SyncContext};
use tokio::sync::broadcast;

pub const OWNER: &str = "me";

pub fn test_config(strategy: ConflictStrategy) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.owner_id = OWNER.to_string();
    config.conflict_strategy = strategy;
    config
}

/// A context over shared in-memory stores
pub fn create_test_context(store: &MemoryStore, remote: &MemoryRemote, config: SyncConfig) -> SyncContext {
    SyncContext::new(config, Arc::new(store.clone()), Arc::new(remote.clone()))
}

/// Everything currently buffered on an event receiver
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
