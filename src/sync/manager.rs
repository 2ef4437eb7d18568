use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::remote::{NotePatch, RemoteError, SharedRemote};
use crate::storage::{
    keys, upsert, BackupError, BackupManager, Note, NoteId, NoteRepository, StorageError,
};

use super::config::{ConfigError, ConflictStrategy, SyncConfig, SyncResult, SyncStatus};
use super::conflict::{self, ConflictRecord};
use super::coordinator::{BroadcastMessage, ChangeKind, Coordinator, CoordinatorError};
use super::events::{EventBus, SyncEvent, WarningLevel};
use super::metadata::{NoteSyncState, SyncStateTracker};
use super::queue::{DrainReport, OperationQueue, OperationType};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Note not found: {0}")]
    NoteNotFound(NoteId),
    #[error("Note {note_id} cannot move from {from} to {to}")]
    InvalidTransition {
        note_id: NoteId,
        from: NoteSyncState,
        to: NoteSyncState,
    },
    #[error("No pending conflict for note {0}")]
    NoPendingConflict(NoteId),
    #[error("Manual is not a resolution strategy")]
    ManualResolution,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Sync state lock poisoned")]
    LockPoisoned,
}

impl SyncError {
    fn is_quota(&self) -> bool {
        match self {
            SyncError::Storage(e) | SyncError::Coordinator(CoordinatorError::Storage(e)) => e.is_quota(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Sequences local writes, queue drains and reconciliation for one context.
///
/// Local writes always land first and are never blocked by the network. The
/// remote side catches up through the operation queue and periodic
/// reconciliation.
pub struct SyncOrchestrator {
    config: SyncConfig,
    repo: NoteRepository,
    remote: SharedRemote,
    coordinator: Arc<Coordinator>,
    queue: Arc<OperationQueue>,
    backups: Arc<BackupManager>,
    events: EventBus,
    states: SyncStateTracker,
    online: AtomicBool,
    offline_since: Mutex<Option<DateTime<Utc>>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    /// Conflicts waiting for a manual decision
    conflicts: Mutex<HashMap<NoteId, ConflictRecord>>,
    /// Held for the whole of a reconciliation pass
    reconciling: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        repo: NoteRepository,
        remote: SharedRemote,
        coordinator: Arc<Coordinator>,
        queue: Arc<OperationQueue>,
        backups: Arc<BackupManager>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            repo,
            remote,
            coordinator,
            queue,
            backups,
            events,
            states: SyncStateTracker::new(),
            online: AtomicBool::new(false),
            offline_since: Mutex::new(None),
            last_sync: Mutex::new(None),
            conflicts: Mutex::new(HashMap::new()),
            reconciling: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Set the initial connectivity without running transition side effects
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            if let Ok(mut since) = self.offline_since.lock() {
                since.get_or_insert_with(Utc::now);
            }
        }
    }

    pub fn pending_operations(&self) -> Result<usize> {
        Ok(self.queue.len()?)
    }

    pub fn state_of(&self, note_id: NoteId) -> NoteSyncState {
        self.states.get(note_id)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync.lock().ok().and_then(|last| *last)
    }

    /// Move a note along the lifecycle; refusals are logged, not raised
    fn mark(&self, note_id: NoteId, state: NoteSyncState) {
        if let Err(e) = self.states.transition(note_id, state) {
            log::debug!("Sync: {}", e);
        }
    }

    // ===== Local writes =====

    /// The UI has unsaved edits for a note
    pub fn begin_edit(&self, note_id: NoteId) {
        self.mark(note_id, NoteSyncState::LocallyModified);
    }

    /// Allocate an id and save a new note
    pub async fn create_note(&self, title: &str, content: &str) -> Result<Note> {
        let note = Note::new(self.repo.next_id()?, title, content);
        self.save(note).await
    }

    /// Accept a local write: store it, queue it for the remote, announce it
    /// to other contexts, and drain right away when online.
    pub async fn save(&self, mut note: Note) -> Result<Note> {
        let now = Utc::now();
        if let Some(existing) = self.repo.get(note.id)? {
            note.unique_id = existing.unique_id;
            note.created_at = existing.created_at;
            note.updated_at = existing.updated_at;
        }
        note.touch(now);
        note.size = note.content.len() as u64;

        self.mark(note.id, NoteSyncState::LocallyModified);
        let created = self.write_local(&note, now)?;

        let op_type = if created {
            OperationType::Create
        } else {
            OperationType::Update
        };
        self.queue.enqueue(op_type, note.id, Some(note.clone()))?;
        self.mark(note.id, NoteSyncState::Queued);

        let kind = if created { ChangeKind::Create } else { ChangeKind::Update };
        if let Err(e) = self.coordinator.broadcast(kind, note.id, Some(&note)) {
            log::warn!("Sync: failed to announce note {}: {}", note.id, e);
        }

        if self.is_online() {
            if let Err(e) = self.sync_pending().await {
                log::warn!("Sync: drain after save failed: {}", e);
            }
        }
        Ok(note)
    }

    pub async fn delete(&self, note_id: NoteId) -> Result<()> {
        let now = Utc::now();
        let removed = self.with_quota_retry(|| {
            if self.coordinator.has_other_active_tabs(now)? {
                let removed = self.coordinator.safe_update(keys::NOTES, |mut notes: Vec<Note>| {
                    let before = notes.len();
                    notes.retain(|n| n.id != note_id);
                    let removed = notes.len() != before;
                    (notes, removed)
                })?;
                self.repo.store().remove(&keys::history(note_id))?;
                Ok(removed)
            } else {
                Ok(self.repo.remove(note_id)?.is_some())
            }
        })?;
        if !removed {
            return Err(SyncError::NoteNotFound(note_id));
        }

        self.queue.enqueue(OperationType::Delete, note_id, None)?;
        self.states.forget(note_id);
        if let Ok(mut conflicts) = self.conflicts.lock() {
            conflicts.remove(&note_id);
        }

        if let Err(e) = self.coordinator.broadcast(ChangeKind::Delete, note_id, None) {
            log::warn!("Sync: failed to announce deletion of note {}: {}", note_id, e);
        }

        if self.is_online() {
            if let Err(e) = self.sync_pending().await {
                log::warn!("Sync: drain after delete failed: {}", e);
            }
        }
        Ok(())
    }

    /// Write one note locally. With other contexts active the write goes
    /// through the coordinator's guarded read-modify-write.
    fn write_local(&self, note: &Note, now: DateTime<Utc>) -> Result<bool> {
        let context_id = self.coordinator.context_id();
        self.with_quota_retry(|| {
            if self.coordinator.has_other_active_tabs(now)? {
                let incoming = note.clone();
                let created = self.coordinator.safe_update(keys::NOTES, move |mut notes: Vec<Note>| {
                    let created = upsert(&mut notes, incoming);
                    (notes, created)
                })?;
                self.repo.append_history(note, context_id)?;
                Ok(created)
            } else {
                Ok(self.repo.put(note, context_id)?)
            }
        })
    }

    /// Run a local write; on quota failure prune hard and try exactly once
    /// more before surfacing a critical warning.
    fn with_quota_retry<T>(&self, mut write: impl FnMut() -> Result<T>) -> Result<T> {
        match write() {
            Err(e) if e.is_quota() => {
                log::warn!("Sync: local write over quota, pruning and retrying");
                self.backups.emergency_prune()?;
                write().map_err(|e| {
                    if e.is_quota() {
                        let ratio = self
                            .repo
                            .store()
                            .usage()
                            .map(|usage| usage.ratio())
                            .unwrap_or(1.0);
                        self.events.emit(SyncEvent::StorageWarning {
                            level: WarningLevel::Critical,
                            usage_ratio: ratio,
                        });
                    }
                    e
                })
            }
            other => other,
        }
    }

    // ===== Connectivity =====

    /// Back online: snapshot, drain the queue, then reconcile once.
    pub async fn handle_online(&self, now: DateTime<Utc>) -> Result<SyncResult> {
        if self.online.swap(true, Ordering::SeqCst) {
            log::debug!("Sync: already online");
            return Ok(SyncResult::default());
        }

        let offline_since = self.offline_since.lock().ok().and_then(|mut since| since.take());
        let offline_duration_ms = offline_since
            .map(|since| (now - since).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let queued_operations = self.queue.len()?;

        log::info!(
            "Sync: back online after {}ms with {} queued operations",
            offline_duration_ms,
            queued_operations,
        );
        self.events.emit(SyncEvent::NetworkReconnected {
            offline_duration_ms,
            queued_operations,
        });

        if let Err(e) = self.backups.snapshot() {
            log::warn!("Sync: pre-sync snapshot failed: {}", e);
        }
        self.sync_pending().await?;
        self.reconcile().await
    }

    /// Gone offline: take a protective snapshot.
    pub fn handle_offline(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.online.swap(false, Ordering::SeqCst) {
            log::debug!("Sync: already offline");
            return Ok(());
        }
        if let Ok(mut since) = self.offline_since.lock() {
            *since = Some(now);
        }

        log::info!("Sync: went offline at {}", now);
        self.events.emit(SyncEvent::NetworkDisconnected { timestamp: now });

        if let Err(e) = self.backups.snapshot() {
            log::warn!("Sync: protective snapshot failed: {}", e);
        }
        Ok(())
    }

    // ===== Queue =====

    /// Drain the operation queue and move the affected notes along.
    pub async fn sync_pending(&self) -> Result<DrainReport> {
        let before = self.queue.pending_note_ids()?;
        for note_id in &before {
            if self.states.get(*note_id) == NoteSyncState::Queued {
                self.mark(*note_id, NoteSyncState::Syncing);
            }
        }

        let report = self.queue.drain().await?;

        let failed: HashSet<NoteId> = report.failed_notes.iter().copied().collect();
        let after = self.queue.pending_note_ids()?;
        for note_id in before {
            if self.states.get(note_id) != NoteSyncState::Syncing {
                continue;
            }
            let next = if failed.contains(&note_id) {
                NoteSyncState::Failed
            } else if after.contains(&note_id) {
                NoteSyncState::Queued
            } else {
                NoteSyncState::Clean
            };
            self.mark(note_id, next);
        }

        Ok(report)
    }

    // ===== Reconciliation =====

    /// One drain followed by one reconciliation pass
    pub async fn sync_now(&self) -> Result<SyncResult> {
        self.sync_pending().await?;
        self.reconcile().await
    }

    /// Diff the local collection against a fresh remote snapshot and settle
    /// every difference. Notes with queued operations are left to the queue.
    pub async fn reconcile(&self) -> Result<SyncResult> {
        let Ok(_guard) = self.reconciling.try_lock() else {
            log::debug!("Sync: reconciliation already running");
            return Ok(SyncResult::default());
        };

        let started = Instant::now();
        let now = Utc::now();
        let owner_id = &self.config.owner_id;

        let remote_notes = self.remote.fetch_all(owner_id).await?;
        let local_notes = self.repo.list()?;
        let pending = self.queue.pending_note_ids()?;
        let plan = conflict::detect(&local_notes, &remote_notes, self.config.conflict_strategy);

        let mut result = SyncResult::default();

        for record in plan.conflicts {
            let note_id = record.note_id();
            if pending.contains(&note_id) {
                continue;
            }
            self.mark(note_id, NoteSyncState::Conflicted);

            if record.strategy == ConflictStrategy::Manual {
                log::info!("Sync: note {} needs a manual decision", note_id);
                if let Ok(mut conflicts) = self.conflicts.lock() {
                    conflicts.insert(note_id, record);
                }
                result.conflicts_pending += 1;
                continue;
            }

            let strategy = record.strategy;
            self.apply_resolution(&record, strategy, now).await?;
            result.conflicts_resolved += 1;
        }

        for note in plan.push {
            if pending.contains(&note.id) {
                continue;
            }
            match self.remote.create(owner_id, &note).await {
                Ok(_) => result.notes_pushed += 1,
                Err(e) => {
                    log::warn!("Sync: push of note {} failed, queueing: {}", note.id, e);
                    self.queue.enqueue(OperationType::Create, note.id, Some(note.clone()))?;
                    self.mark(note.id, NoteSyncState::Queued);
                }
            }
        }

        let incoming: Vec<Note> = plan
            .pull
            .into_iter()
            .chain(plan.remote_newer)
            .filter(|note| !pending.contains(&note.id))
            .collect();
        for note in &incoming {
            let created = self.write_local(note, now)?;
            let kind = if created { ChangeKind::Create } else { ChangeKind::Update };
            if let Err(e) = self.coordinator.broadcast(kind, note.id, Some(note)) {
                log::warn!("Sync: failed to announce pulled note {}: {}", note.id, e);
            }
            result.notes_pulled += 1;
        }

        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(now);
        }
        result.duration_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "Sync: reconciled, pulled={}, pushed={}, resolved={}, pending={} in {}ms",
            result.notes_pulled,
            result.notes_pushed,
            result.conflicts_resolved,
            result.conflicts_pending,
            result.duration_ms,
        );
        Ok(result)
    }

    /// Write both sides of a resolution, local first. A failed remote write
    /// is handed to the queue so the resolution is never left half-applied.
    async fn apply_resolution(
        &self,
        record: &ConflictRecord,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let note_id = record.note_id();
        let Some(resolution) = conflict::resolve(&record.local, &record.remote, strategy, now) else {
            return Err(SyncError::ManualResolution);
        };

        if resolution.local != record.local {
            self.write_local(&resolution.local, now)?;
        }
        self.mark(note_id, NoteSyncState::Resolved);

        if resolution.remote != record.remote {
            let patch = NotePatch::from_note(&resolution.remote);
            if let Err(e) = self.remote.update(note_id, &patch).await {
                log::warn!("Sync: remote side of note {} resolution failed, queueing: {}", note_id, e);
                self.queue.enqueue(OperationType::Update, note_id, Some(resolution.remote))?;
                self.mark(note_id, NoteSyncState::Queued);
                return Ok(());
            }
        }

        log::info!("Sync: resolved conflict on note {} with {:?}", note_id, strategy);
        self.mark(note_id, NoteSyncState::Clean);
        Ok(())
    }

    /// Conflicts left for the user, ordered by note id
    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        let Ok(conflicts) = self.conflicts.lock() else {
            return Vec::new();
        };
        let mut records: Vec<ConflictRecord> = conflicts.values().cloned().collect();
        records.sort_by_key(|r| r.note_id());
        records
    }

    /// Settle a conflict held for manual resolution with the chosen strategy
    pub async fn resolve_conflict(&self, note_id: NoteId, strategy: ConflictStrategy) -> Result<()> {
        if strategy == ConflictStrategy::Manual {
            return Err(SyncError::ManualResolution);
        }
        let record = self
            .conflicts
            .lock()
            .map_err(|_| SyncError::LockPoisoned)?
            .remove(&note_id)
            .ok_or(SyncError::NoPendingConflict(note_id))?;

        if let Err(e) = self.apply_resolution(&record, strategy, Utc::now()).await {
            if let Ok(mut conflicts) = self.conflicts.lock() {
                conflicts.insert(note_id, record);
            }
            return Err(e);
        }
        Ok(())
    }

    // ===== Other contexts =====

    /// React to a change announced by another context.
    ///
    /// Returns `false` for own, stale or duplicate messages. An update for a
    /// note with unsaved local edits raises an edit conflict.
    pub fn handle_broadcast(&self, message: &BroadcastMessage) -> Result<bool> {
        if !self.coordinator.accept(message) {
            return Ok(false);
        }

        match (message.kind, &message.note) {
            (ChangeKind::Delete, _) => {
                log::debug!("Sync: note {} deleted in context {}", message.note_id, message.origin_context_id);
                self.states.forget(message.note_id);
            }
            (_, Some(external)) if self.states.get(message.note_id) == NoteSyncState::LocallyModified => {
                let local_content = self
                    .repo
                    .get(message.note_id)?
                    .map(|n| n.content)
                    .unwrap_or_default();
                log::info!(
                    "Sync: note {} changed in context {} while being edited here",
                    message.note_id,
                    message.origin_context_id,
                );
                self.events.emit(SyncEvent::EditConflict {
                    note_id: message.note_id,
                    external_note: external.clone(),
                    local_content,
                });
            }
            _ => {
                log::debug!("Sync: note {} changed in context {}", message.note_id, message.origin_context_id);
            }
        }
        Ok(true)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let counts = self.states.counts();
        Ok(SyncStatus {
            online: self.is_online(),
            pending_operations: self.pending_operations()?,
            last_sync: self.last_sync(),
            conflicts: self.conflicts.lock().map(|c| c.len()).unwrap_or_default(),
            locally_modified: counts.locally_modified,
            queued: counts.queued,
            failed: counts.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteCall};
    use crate::storage::MemoryStore;
    use crate::sync::coordinator::StorageBroadcastChannel;
    use chrono::Duration;

    struct Fixture {
        orchestrator: SyncOrchestrator,
        repo: NoteRepository,
        remote: MemoryRemote,
        events: EventBus,
    }

    fn create_test_orchestrator(strategy: ConflictStrategy) -> Fixture {
        let store: crate::storage::SharedLocalStore = Arc::new(MemoryStore::new());
        let mut config = SyncConfig::default();
        config.owner_id = "me".into();
        config.conflict_strategy = strategy;

        let repo = NoteRepository::new(store.clone(), config.history_limit);
        let remote = MemoryRemote::new();
        let events = EventBus::new();
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::new(StorageBroadcastChannel::new(store.clone())),
            config.tabs.clone(),
        ));
        let queue = Arc::new(OperationQueue::new(
            repo.clone(),
            Arc::new(remote.clone()),
            config.owner_id.clone(),
            config.queue.clone(),
            events.clone(),
        ));
        let backups = Arc::new(BackupManager::new(
            repo.clone(),
            config.backup.clone(),
            events.clone(),
            coordinator.context_id().to_string(),
        ));
        let orchestrator = SyncOrchestrator::new(
            config,
            repo.clone(),
            Arc::new(remote.clone()),
            coordinator,
            queue,
            backups,
            events.clone(),
        );
        Fixture {
            orchestrator,
            repo,
            remote,
            events,
        }
    }

    #[tokio::test]
    async fn test_offline_save_is_local_and_queued() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let note = f.orchestrator.create_note("Groceries", "milk").await.unwrap();

        assert_eq!(f.repo.get(note.id).unwrap().unwrap().content, "milk");
        assert_eq!(f.orchestrator.state_of(note.id), NoteSyncState::Queued);
        assert!(f.remote.calls().is_empty());
        assert_eq!(f.orchestrator.status().unwrap().pending_operations, 1);
    }

    #[tokio::test]
    async fn test_online_save_drains_immediately() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        f.orchestrator.set_online(true);

        let note = f.orchestrator.create_note("t", "c").await.unwrap();
        assert_eq!(f.orchestrator.state_of(note.id), NoteSyncState::Clean);
        assert_eq!(f.remote.note(note.id).unwrap().content, "c");
    }

    #[tokio::test]
    async fn test_save_keeps_identity_and_advances_timestamp() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let first = f.orchestrator.create_note("t", "v1").await.unwrap();

        let mut edited = Note::new(first.id, "t", "v2");
        edited.updated_at = first.updated_at - Duration::hours(1);
        let saved = f.orchestrator.save(edited).await.unwrap();

        assert_eq!(saved.unique_id, first.unique_id);
        assert_eq!(saved.created_at, first.created_at);
        assert!(saved.updated_at >= first.updated_at);
        assert_eq!(f.repo.history(first.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_unknown_note() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        assert!(matches!(
            f.orchestrator.delete(99).await,
            Err(SyncError::NoteNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_emits_and_syncs() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let mut rx = f.events.subscribe();
        let t0 = Utc::now();

        f.orchestrator.set_online(true);
        f.orchestrator.handle_offline(t0).unwrap();
        f.orchestrator.create_note("offline", "draft").await.unwrap();
        f.remote.seed("me", Note::new(50, "from elsewhere", "hi"));

        let result = f.orchestrator.handle_online(t0 + Duration::seconds(3)).await.unwrap();
        assert_eq!(result.notes_pulled, 1);
        assert!(f.repo.contains(50).unwrap());
        assert_eq!(f.remote.notes().len(), 2);

        assert!(matches!(rx.try_recv(), Ok(SyncEvent::NetworkDisconnected { .. })));
        match rx.try_recv() {
            Ok(SyncEvent::NetworkReconnected {
                offline_duration_ms,
                queued_operations,
            }) => {
                assert_eq!(offline_duration_ms, 3000);
                assert_eq!(queued_operations, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.orchestrator.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_skips_notes_with_pending_operations() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let note = f.orchestrator.create_note("t", "local").await.unwrap();

        let result = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(result.notes_pushed, 0);
        assert!(!f.remote.calls().iter().any(|c| matches!(c, RemoteCall::Create(_))));
        assert!(f.orchestrator.status().unwrap().pending_operations > 0);
        assert_eq!(f.repo.get(note.id).unwrap().unwrap().content, "local");
    }

    #[tokio::test]
    async fn test_remote_newer_fast_forwards() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let mut local = Note::new(3, "t", "old");
        local.updated_at = Utc::now() - Duration::minutes(5);
        f.repo.put(&local, "ctx").unwrap();

        let mut remote = local.clone();
        remote.set_content("new");
        remote.updated_at = Utc::now();
        f.remote.seed("me", remote);

        let result = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(result.notes_pulled, 1);
        assert_eq!(f.repo.get(3).unwrap().unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_manual_conflict_waits_for_decision() {
        let f = create_test_orchestrator(ConflictStrategy::Manual);
        let t = Utc::now();
        let mut local = Note::new(4, "t", "mine");
        local.updated_at = t + Duration::seconds(10);
        f.repo.put(&local, "ctx").unwrap();
        let mut remote = local.clone();
        remote.set_content("theirs");
        remote.updated_at = t;
        f.remote.seed("me", remote);

        let result = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(result.conflicts_pending, 1);
        assert_eq!(f.orchestrator.state_of(4), NoteSyncState::Conflicted);
        assert_eq!(f.orchestrator.pending_conflicts().len(), 1);

        f.orchestrator
            .resolve_conflict(4, ConflictStrategy::KeepRemote)
            .await
            .unwrap();
        assert_eq!(f.repo.get(4).unwrap().unwrap().content, "theirs");
        assert_eq!(f.orchestrator.state_of(4), NoteSyncState::Clean);
        assert!(matches!(
            f.orchestrator.resolve_conflict(4, ConflictStrategy::KeepLocal).await,
            Err(SyncError::NoPendingConflict(4))
        ));
    }

    #[tokio::test]
    async fn test_conflict_on_note_being_edited_settles() {
        let f = create_test_orchestrator(ConflictStrategy::Manual);
        let t = Utc::now();
        let mut local = Note::new(4, "t", "mine");
        local.updated_at = t + Duration::seconds(10);
        f.repo.put(&local, "ctx").unwrap();
        let mut remote = local.clone();
        remote.set_content("theirs");
        remote.updated_at = t;
        f.remote.seed("me", remote);
        f.orchestrator.begin_edit(4);

        let result = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(result.conflicts_pending, 1);
        assert_eq!(f.orchestrator.state_of(4), NoteSyncState::Conflicted);

        f.orchestrator
            .resolve_conflict(4, ConflictStrategy::KeepLocal)
            .await
            .unwrap();
        assert_eq!(f.orchestrator.state_of(4), NoteSyncState::Clean);
        assert_eq!(f.orchestrator.status().unwrap().locally_modified, 0);
        assert_eq!(f.remote.note(4).unwrap().content, "mine");
    }

    #[tokio::test]
    async fn test_failed_remote_resolution_is_queued() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let t = Utc::now();
        let mut local = Note::new(6, "t", "mine");
        local.updated_at = t + Duration::seconds(10);
        f.repo.put(&local, "ctx").unwrap();
        let mut remote = local.clone();
        remote.set_content("theirs");
        remote.updated_at = t;
        f.remote.seed("me", remote);
        f.remote.fail_note(6);

        let result = f.orchestrator.reconcile().await.unwrap();
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(f.orchestrator.state_of(6), NoteSyncState::Queued);
        let pending = f.orchestrator.queue.pending().unwrap();
        assert_eq!(pending[0].op_type, OperationType::Update);
        assert_eq!(pending[0].payload.as_ref().unwrap().content, "mine");
    }

    #[test]
    fn test_broadcast_during_edit_raises_conflict() {
        let f = create_test_orchestrator(ConflictStrategy::KeepLocal);
        let mut rx = f.events.subscribe();
        f.repo.put(&Note::new(8, "t", "my draft"), "ctx").unwrap();
        f.orchestrator.begin_edit(8);

        let message = BroadcastMessage {
            kind: ChangeKind::Update,
            note_id: 8,
            note: Some(Note::new(8, "t", "their edit")),
            origin_context_id: "ctx-other".into(),
            timestamp: Utc::now().timestamp_millis(),
        };
        assert!(f.orchestrator.handle_broadcast(&message).unwrap());
        assert!(!f.orchestrator.handle_broadcast(&message).unwrap());

        match rx.try_recv() {
            Ok(SyncEvent::EditConflict { note_id, local_content, .. }) => {
                assert_eq!(note_id, 8);
                assert_eq!(local_content, "my draft");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
