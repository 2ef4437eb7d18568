//! Rolling full-state snapshots, quota monitoring, crash detection and restore.
//!
//! Snapshots live under `backup.<millis>` keys in the local store. Each one
//! holds the whole note collection plus every edit-history sidecar. Only the
//! newest `max_backups` are kept.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::sync::config::BackupConfig;
use crate::sync::events::{EventBus, SyncEvent, WarningLevel};

use super::keys;
use super::local::{get_json, set_json, LocalStore, StorageError};
use super::models::{HistoryEntry, Note, NoteId};
use super::notes::NoteRepository;
use super::quota::{self, PruneReport, QuotaStatus};

/// Layout version written into every snapshot
pub const SCHEMA_VERSION: u32 = 1;

/// Label of the snapshot taken right before a restore
pub const PRE_RESTORE_LABEL: &str = "pre-restore";

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup validation failed: {0}")]
    Validation(String),
    #[error("Backup not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Full point-in-time copy of the note collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub note_count: usize,
    pub notes: Vec<Note>,
    #[serde(default)]
    pub edit_history_by_note_id: HashMap<NoteId, Vec<HistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Listing entry; `valid` is false when the stored payload fails validation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub note_count: usize,
    pub label: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Heartbeat {
    timestamp: DateTime<Utc>,
    context_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct CleanShutdown {
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub last_heartbeat: DateTime<Utc>,
    pub backups_available: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub notes_restored: usize,
    pub forensic_snapshot_id: String,
}

pub struct BackupManager {
    repo: NoteRepository,
    config: BackupConfig,
    events: EventBus,
    context_id: String,
    /// Last snapshot id handed out, keeps ids strictly increasing
    last_id: Mutex<i64>,
}

impl BackupManager {
    pub fn new(repo: NoteRepository, config: BackupConfig, events: EventBus, context_id: String) -> Self {
        Self {
            repo,
            config,
            events,
            context_id,
            last_id: Mutex::new(0),
        }
    }

    fn store(&self) -> &dyn LocalStore {
        self.repo.store().as_ref()
    }

    // ===== Lifecycle =====

    /// Detect an unclean previous exit, then mark this context as running.
    pub fn start(&self, now: DateTime<Utc>) -> Result<Option<CrashReport>> {
        let crash = self.detect_crash(now)?;
        if let Some(report) = &crash {
            log::warn!(
                "Recovery: crash detected (last heartbeat {}), {} backups available",
                report.last_heartbeat,
                report.backups_available,
            );
            self.events.emit(SyncEvent::CrashDetected {
                has_backups: report.backups_available > 0,
                last_heartbeat: report.last_heartbeat,
            });
        }

        self.store().remove(keys::CLEAN_SHUTDOWN)?;
        self.beat(now)?;
        Ok(crash)
    }

    /// Record a clean shutdown and clear the heartbeat.
    pub fn stop(&self, now: DateTime<Utc>) -> Result<()> {
        set_json(self.store(), keys::CLEAN_SHUTDOWN, &CleanShutdown { timestamp: now })?;
        self.store().remove(keys::HEARTBEAT)?;
        log::info!("Recovery: clean shutdown recorded");
        Ok(())
    }

    /// Refresh the crash heartbeat
    pub fn beat(&self, now: DateTime<Utc>) -> Result<()> {
        let heartbeat = Heartbeat {
            timestamp: now,
            context_id: self.context_id.clone(),
        };
        set_json(self.store(), keys::HEARTBEAT, &heartbeat)?;
        Ok(())
    }

    /// A crash is assumed when a heartbeat older than the threshold exists
    /// and no clean-shutdown marker was written after it.
    pub fn detect_crash(&self, now: DateTime<Utc>) -> Result<Option<CrashReport>> {
        let Some(heartbeat) = get_json::<Heartbeat>(self.store(), keys::HEARTBEAT)? else {
            return Ok(None);
        };

        let threshold = self.config.crash_threshold();
        if now - heartbeat.timestamp <= threshold {
            // Recent heartbeat: another context is probably still alive
            return Ok(None);
        }

        let clean = get_json::<CleanShutdown>(self.store(), keys::CLEAN_SHUTDOWN)?;
        if matches!(clean, Some(marker) if marker.timestamp >= heartbeat.timestamp) {
            return Ok(None);
        }

        Ok(Some(CrashReport {
            last_heartbeat: heartbeat.timestamp,
            backups_available: quota::backup_ids(self.store())?.len(),
        }))
    }

    // ===== Quota =====

    /// Emit a warning above the warning ratio and prune above the critical one.
    pub fn check_quota(&self) -> Result<QuotaStatus> {
        let usage = self.store().usage()?;
        let status = QuotaStatus::assess(&usage, self.config.warning_ratio, self.config.critical_ratio);

        match status {
            QuotaStatus::Ok(_) => {}
            QuotaStatus::Warning(ratio) => {
                log::warn!("Quota: usage at {:.0}%", ratio * 100.0);
                self.events.emit(SyncEvent::StorageWarning {
                    level: WarningLevel::Warning,
                    usage_ratio: ratio,
                });
            }
            QuotaStatus::Critical(ratio) => {
                log::warn!("Quota: usage at {:.0}%, running emergency prune", ratio * 100.0);
                self.events.emit(SyncEvent::StorageWarning {
                    level: WarningLevel::Warning,
                    usage_ratio: ratio,
                });
                self.emergency_prune()?;
            }
        }

        Ok(status)
    }

    pub fn emergency_prune(&self) -> Result<PruneReport> {
        Ok(quota::emergency_prune(self.store())?)
    }

    // ===== Snapshots =====

    /// Capture the current state into a new snapshot and prune old ones.
    pub fn snapshot(&self) -> Result<String> {
        self.snapshot_labelled(None)
    }

    pub fn snapshot_labelled(&self, label: Option<&str>) -> Result<String> {
        self.check_quota()?;

        let now = Utc::now();
        let id = self.next_id(now)?;
        let payload = self.capture(now, label)?;
        self.write_with_retry(&keys::backup(&id), payload)?;

        let pruned = self.prune()?;
        log::info!("Backup: wrote snapshot {} (pruned {})", id, pruned);
        Ok(id)
    }

    /// Build the snapshot payload from raw store values so that a corrupt
    /// collection can still be captured for forensics.
    fn capture(&self, now: DateTime<Utc>, label: Option<&str>) -> Result<Value> {
        let notes = self.store().get(keys::NOTES)?.unwrap_or_else(|| json!([]));
        let note_count = notes.as_array().map_or(0, Vec::len);

        let mut history = Map::new();
        for key in self.store().keys()? {
            if let Some(note_id) = keys::history_note_id(&key) {
                if let Some(entries) = self.store().get(&key)? {
                    history.insert(note_id.to_string(), entries);
                }
            }
        }

        let mut payload = json!({
            "timestamp": now,
            "schemaVersion": SCHEMA_VERSION,
            "noteCount": note_count,
            "notes": notes,
            "editHistoryByNoteId": history,
        });
        if let Some(label) = label {
            payload["label"] = json!(label);
        }
        Ok(payload)
    }

    /// Write once; on quota failure prune hard and retry exactly once.
    fn write_with_retry(&self, key: &str, payload: Value) -> Result<()> {
        match self.store().set(key, payload.clone()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_quota() => {
                log::warn!("Backup: quota exceeded writing {}, pruning and retrying", key);
                self.emergency_prune()?;
                self.store().set(key, payload).map_err(|e| {
                    if e.is_quota() {
                        let ratio = self.store().usage().map(|u| u.ratio()).unwrap_or(1.0);
                        log::error!("Backup: still over quota after emergency prune");
                        self.events.emit(SyncEvent::StorageWarning {
                            level: WarningLevel::Critical,
                            usage_ratio: ratio,
                        });
                    }
                    BackupError::from(e)
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_id(&self, now: DateTime<Utc>) -> Result<String> {
        let mut last = self
            .last_id
            .lock()
            .map_err(|_| BackupError::Storage(StorageError::LockPoisoned))?;
        let newest_stored = quota::backup_ids(self.store())?
            .last()
            .and_then(|id| id.parse::<i64>().ok())
            .unwrap_or(0);
        let id = now.timestamp_millis().max(*last + 1).max(newest_stored + 1);
        *last = id;
        Ok(id.to_string())
    }

    /// Drop all but the newest `max_backups` snapshots
    pub fn prune(&self) -> Result<usize> {
        let ids = quota::backup_ids(self.store())?;
        if ids.len() <= self.config.max_backups {
            return Ok(0);
        }
        let excess = ids.len() - self.config.max_backups;
        for id in &ids[..excess] {
            self.store().remove(&keys::backup(id))?;
        }
        Ok(excess)
    }

    /// Snapshots newest first
    pub fn list_snapshots(&self) -> Result<Vec<BackupInfo>> {
        let mut infos = Vec::new();
        for id in quota::backup_ids(self.store())?.into_iter().rev() {
            let Some(raw) = self.store().get(&keys::backup(&id))? else {
                continue;
            };
            let info = match validate(&raw) {
                Ok(snapshot) => BackupInfo {
                    id,
                    timestamp: Some(snapshot.timestamp),
                    note_count: snapshot.note_count,
                    label: snapshot.label,
                    valid: true,
                },
                Err(_) => BackupInfo {
                    id,
                    timestamp: None,
                    note_count: 0,
                    label: None,
                    valid: false,
                },
            };
            infos.push(info);
        }
        Ok(infos)
    }

    pub fn load(&self, snapshot_id: &str) -> Result<BackupSnapshot> {
        let raw = self
            .store()
            .get(&keys::backup(snapshot_id))?
            .ok_or_else(|| BackupError::NotFound(snapshot_id.to_string()))?;
        validate(&raw)
    }

    // ===== Restore =====

    /// Restore a snapshot (the newest by default) over the primary collection
    /// and history sidecars. Nothing is mutated if the snapshot is malformed.
    pub fn restore(&self, snapshot_id: Option<&str>) -> Result<RestoreReport> {
        self.check_quota()?;

        let snapshot_id = match snapshot_id {
            Some(id) => id.to_string(),
            None => self.default_restore_id()?,
        };

        let snapshot = match self.load(&snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Backup: restore of {} rejected: {}", snapshot_id, e);
                return Err(e);
            }
        };

        let forensic_snapshot_id = self.snapshot_labelled(Some(PRE_RESTORE_LABEL))?;

        self.repo.replace_all(&snapshot.notes)?;
        for (note_id, entries) in &snapshot.edit_history_by_note_id {
            self.repo.set_history(*note_id, entries)?;
        }
        let keep: Vec<NoteId> = snapshot.edit_history_by_note_id.keys().copied().collect();
        self.repo.prune_history_except(&keep)?;

        log::info!(
            "Backup: restored {} notes from snapshot {} (pre-restore copy {})",
            snapshot.notes.len(),
            snapshot_id,
            forensic_snapshot_id,
        );

        Ok(RestoreReport {
            snapshot_id,
            notes_restored: snapshot.notes.len(),
            forensic_snapshot_id,
        })
    }

    /// Newest valid snapshot that is not a pre-restore copy
    fn default_restore_id(&self) -> Result<String> {
        self.list_snapshots()?
            .into_iter()
            .find(|info| info.valid && info.label.as_deref() != Some(PRE_RESTORE_LABEL))
            .map(|info| info.id)
            .ok_or_else(|| BackupError::NotFound("no restorable backups".to_string()))
    }
}

/// Check the structural shape of a stored snapshot before trusting it
pub fn validate(raw: &Value) -> Result<BackupSnapshot> {
    let invalid = |msg: &str| BackupError::Validation(msg.to_string());

    let obj = raw.as_object().ok_or_else(|| invalid("snapshot is not an object"))?;

    let version = obj
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("missing schemaVersion"))?;
    if version > SCHEMA_VERSION as u64 {
        return Err(BackupError::Validation(format!(
            "unsupported schemaVersion {}",
            version
        )));
    }

    let notes = obj
        .get("notes")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("notes is not an array"))?;

    let note_count = obj
        .get("noteCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("missing noteCount"))?;
    if note_count as usize != notes.len() {
        return Err(BackupError::Validation(format!(
            "noteCount {} does not match {} notes",
            note_count,
            notes.len()
        )));
    }

    if let Some(history) = obj.get("editHistoryByNoteId") {
        if !history.is_object() {
            return Err(invalid("editHistoryByNoteId is not an object"));
        }
    }

    let snapshot: BackupSnapshot = serde_json::from_value(raw.clone())
        .map_err(|e| BackupError::Validation(format!("malformed snapshot: {}", e)))?;

    let mut seen = HashSet::new();
    for note in &snapshot.notes {
        if !seen.insert(note.id) {
            return Err(BackupError::Validation(format!("duplicate note id {}", note.id)));
        }
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn create_test_manager(max_backups: usize) -> (BackupManager, NoteRepository, EventBus) {
        let repo = NoteRepository::new(Arc::new(MemoryStore::new()), 50);
        let events = EventBus::new();
        let config = BackupConfig {
            max_backups,
            ..Default::default()
        };
        let manager = BackupManager::new(repo.clone(), config, events.clone(), "ctx-test".into());
        (manager, repo, events)
    }

    #[test]
    fn test_snapshot_captures_notes_and_history() {
        let (manager, repo, _events) = create_test_manager(10);
        repo.put(&Note::new(1, "a", "alpha"), "ctx").unwrap();
        repo.put(&Note::new(2, "b", "beta"), "ctx").unwrap();

        let id = manager.snapshot().unwrap();
        let snapshot = manager.load(&id).unwrap();

        assert_eq!(snapshot.note_count, 2);
        assert_eq!(snapshot.schema_version, SCHEMA_VERSION);
        assert_eq!(snapshot.edit_history_by_note_id.len(), 2);
    }

    #[test]
    fn test_snapshot_ids_strictly_increase() {
        let (manager, _repo, _events) = create_test_manager(10);
        let first: i64 = manager.snapshot().unwrap().parse().unwrap();
        let second: i64 = manager.snapshot().unwrap().parse().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_restore_rejects_malformed_without_mutation() {
        let (manager, repo, _events) = create_test_manager(10);
        repo.put(&Note::new(1, "keep", "me"), "ctx").unwrap();

        manager
            .store()
            .set(&keys::backup("5"), json!({"schemaVersion": 1, "noteCount": 3, "notes": []}))
            .unwrap();

        let err = manager.restore(Some("5")).unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
        assert_eq!(repo.list().unwrap().len(), 1);
        // No forensic snapshot was taken either
        assert_eq!(quota::backup_ids(manager.store()).unwrap(), vec!["5".to_string()]);
    }

    #[test]
    fn test_restore_defaults_to_newest_and_keeps_forensic_copy() {
        let (manager, repo, _events) = create_test_manager(10);
        repo.put(&Note::new(1, "v1", "first"), "ctx").unwrap();
        manager.snapshot().unwrap();

        repo.put(&Note::new(2, "extra", "added later"), "ctx").unwrap();
        let newest = manager.snapshot().unwrap();

        // Corrupt the primary collection
        manager.store().set(keys::NOTES, json!("garbage")).unwrap();

        let report = manager.restore(None).unwrap();
        assert_eq!(report.snapshot_id, newest);
        assert_eq!(report.notes_restored, 2);
        assert_eq!(repo.list().unwrap().len(), 2);

        let forensic = manager.store().get(&keys::backup(&report.forensic_snapshot_id)).unwrap().unwrap();
        assert_eq!(forensic["notes"], json!("garbage"));
        assert_eq!(forensic["label"], json!(PRE_RESTORE_LABEL));
    }

    #[test]
    fn test_repeated_default_restore_skips_pre_restore_copies() {
        let (manager, repo, _events) = create_test_manager(10);
        repo.put(&Note::new(1, "good", "state"), "ctx").unwrap();
        let good = manager.snapshot().unwrap();
        manager.store().set(keys::NOTES, json!("garbage")).unwrap();

        let first = manager.restore(None).unwrap();
        let second = manager.restore(None).unwrap();

        assert_eq!(first.snapshot_id, good);
        assert_eq!(second.snapshot_id, good);
        assert_eq!(repo.list().unwrap()[0].title, "good");
    }

    #[test]
    fn test_restore_drops_history_for_notes_not_in_snapshot() {
        let (manager, repo, _events) = create_test_manager(10);
        repo.put(&Note::new(1, "a", "b"), "ctx").unwrap();
        let id = manager.snapshot().unwrap();
        repo.put(&Note::new(9, "later", "x"), "ctx").unwrap();

        manager.restore(Some(&id)).unwrap();
        assert!(repo.history(9).unwrap().is_empty());
        assert_eq!(repo.history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_crash_detection() {
        let (manager, _repo, events) = create_test_manager(10);
        let mut rx = events.subscribe();
        let t0 = Utc::now();

        // Fresh store: nothing to detect
        assert!(manager.start(t0).unwrap().is_none());

        // Heartbeat left behind, no clean shutdown, 10 minutes later
        let later = t0 + Duration::minutes(10);
        let report = manager.start(later).unwrap().unwrap();
        assert_eq!(report.last_heartbeat, t0);
        assert!(matches!(rx.try_recv(), Ok(SyncEvent::CrashDetected { has_backups: false, .. })));
    }

    #[test]
    fn test_clean_shutdown_is_not_a_crash() {
        let (manager, _repo, _events) = create_test_manager(10);
        let t0 = Utc::now();
        manager.start(t0).unwrap();
        manager.stop(t0 + Duration::seconds(5)).unwrap();

        assert!(manager.detect_crash(t0 + Duration::hours(1)).unwrap().is_none());
    }

    #[test]
    fn test_recent_heartbeat_is_not_a_crash() {
        let (manager, _repo, _events) = create_test_manager(10);
        let t0 = Utc::now();
        manager.beat(t0).unwrap();
        assert!(manager.detect_crash(t0 + Duration::minutes(2)).unwrap().is_none());
    }

    #[test]
    fn test_oversized_crash_threshold_does_not_panic() {
        let repo = NoteRepository::new(Arc::new(MemoryStore::new()), 50);
        let config = BackupConfig {
            crash_threshold_secs: u64::MAX,
            ..Default::default()
        };
        let manager = BackupManager::new(repo, config, EventBus::new(), "ctx".into());
        let t0 = Utc::now();
        manager.beat(t0).unwrap();
        assert!(manager.detect_crash(t0 + Duration::days(365)).unwrap().is_none());
    }

    #[test]
    fn test_quota_warning_emitted() {
        let store = MemoryStore::with_quota(1000);
        store.set("filler", json!("x".repeat(850))).unwrap();
        let repo = NoteRepository::new(Arc::new(store), 50);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = BackupManager::new(repo, BackupConfig::default(), events, "ctx".into());

        assert!(matches!(manager.check_quota().unwrap(), QuotaStatus::Warning(_)));
        assert!(matches!(
            rx.try_recv(),
            Ok(SyncEvent::StorageWarning { level: WarningLevel::Warning, .. })
        ));
    }
}
