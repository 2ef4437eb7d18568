//! Logical keys shared by every context of the same origin.

use super::models::NoteId;

/// Primary note collection
pub const NOTES: &str = "notes";

/// Durable offline operation queue
pub const QUEUE: &str = "sync.queue";

/// Active-context registry
pub const TABS: &str = "sync.tabs";

/// Transient key written then removed to notify other contexts
pub const NOTIFY: &str = "sync.notify";

/// Crash heartbeat, refreshed while a context runs
pub const HEARTBEAT: &str = "recovery.heartbeat";

/// Written on clean shutdown, cleared on start
pub const CLEAN_SHUTDOWN: &str = "recovery.clean-shutdown";

const HISTORY_PREFIX: &str = "history.";
const BACKUP_PREFIX: &str = "backup.";
const DRAFT_PREFIX: &str = "draft.";
const CACHE_PREFIX: &str = "cache.";

pub fn history(note_id: NoteId) -> String {
    format!("{}{}", HISTORY_PREFIX, note_id)
}

pub fn history_note_id(key: &str) -> Option<NoteId> {
    key.strip_prefix(HISTORY_PREFIX)?.parse().ok()
}

pub fn backup(snapshot_id: &str) -> String {
    format!("{}{}", BACKUP_PREFIX, snapshot_id)
}

pub fn backup_id(key: &str) -> Option<&str> {
    key.strip_prefix(BACKUP_PREFIX)
}

/// Keys that may be dropped under storage pressure without losing user data
pub fn is_ephemeral(key: &str) -> bool {
    key == NOTIFY || key.starts_with(DRAFT_PREFIX) || key.starts_with(CACHE_PREFIX)
}
