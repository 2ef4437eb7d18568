use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::remote::{NotePatch, RemoteError, SharedRemote};
use crate::storage::{get_json, keys, set_json, Note, NoteId, NoteRepository, StorageError};

use super::config::QueueConfig;
use super::events::{EventBus, SyncEvent};

type Result<T> = std::result::Result<T, StorageError>;

/// Kind of remote mutation a queued operation performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// A single pending remote mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub note_id: NoteId,
    /// Note content to send; absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Note>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the next attempt may run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another pass was already running; nothing was attempted
    pub busy: bool,
    pub succeeded: usize,
    /// Target note vanished locally, or was already gone remotely
    pub skipped: usize,
    /// Failed and rescheduled with backoff
    pub retried: usize,
    /// Retries exhausted, removed and surfaced
    pub failed: usize,
    /// Not yet due, or blocked behind an earlier operation for the same note
    pub deferred: usize,
    /// Notes whose operation was given up on in this pass
    pub failed_notes: Vec<NoteId>,
}

enum Attempt {
    Applied,
    Vacuous,
}

/// A failed attempt; both kinds go through retry and backoff
#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Local read failed: {0}")]
    Local(#[from] StorageError),
}

/// Durable FIFO of pending remote mutations.
///
/// The whole queue lives under one key and is rewritten on every mutation, so
/// any context sharing the store sees the same pending work.
pub struct OperationQueue {
    repo: NoteRepository,
    remote: SharedRemote,
    owner_id: String,
    config: QueueConfig,
    events: EventBus,
    /// Guards the read-modify-write of the queue key within this process
    lock: Mutex<()>,
    draining: AtomicBool,
}

/// Clears the drain flag however the pass ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OperationQueue {
    pub fn new(
        repo: NoteRepository,
        remote: SharedRemote,
        owner_id: String,
        config: QueueConfig,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            remote,
            owner_id,
            config,
            events,
            lock: Mutex::new(()),
            draining: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Result<Vec<QueuedOperation>> {
        Ok(get_json(self.repo.store().as_ref(), keys::QUEUE)?.unwrap_or_default())
    }

    fn modify<R>(&self, f: impl FnOnce(&mut Vec<QueuedOperation>) -> R) -> Result<R> {
        let _guard = self.lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut ops = self.read()?;
        let out = f(&mut ops);
        set_json(self.repo.store().as_ref(), keys::QUEUE, &ops)?;
        Ok(out)
    }

    /// Pending operations in FIFO order
    pub fn pending(&self) -> Result<Vec<QueuedOperation>> {
        self.read()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    pub fn has_pending_for(&self, note_id: NoteId) -> Result<bool> {
        Ok(self.read()?.iter().any(|op| op.note_id == note_id))
    }

    pub fn pending_note_ids(&self) -> Result<HashSet<NoteId>> {
        Ok(self.read()?.iter().map(|op| op.note_id).collect())
    }

    /// Earliest scheduled retry among pending operations
    pub fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.iter().filter_map(|op| op.next_attempt_at).min())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Append an operation, coalescing with pending work for the same note.
    ///
    /// An update replaces the payload of a pending update or create that is
    /// last in line for the note. A delete drops pending updates. Returns the
    /// id of the operation now carrying the change.
    pub fn enqueue(&self, op_type: OperationType, note_id: NoteId, payload: Option<Note>) -> Result<Uuid> {
        let max_retries = self.config.max_retries;
        self.modify(|ops| {
            if op_type == OperationType::Update {
                let last = ops.iter_mut().rev().find(|op| op.note_id == note_id);
                if let Some(last) = last {
                    if matches!(last.op_type, OperationType::Update | OperationType::Create) {
                        log::debug!("Queue: coalesced update for note {} into {}", note_id, last.id);
                        last.payload = payload;
                        return last.id;
                    }
                }
            }

            if op_type == OperationType::Delete {
                let before = ops.len();
                ops.retain(|op| !(op.note_id == note_id && op.op_type == OperationType::Update));
                if ops.len() != before {
                    log::debug!("Queue: delete of note {} dropped {} pending updates", note_id, before - ops.len());
                }
            }

            let op = QueuedOperation {
                id: Uuid::new_v4(),
                op_type,
                note_id,
                payload,
                enqueued_at: Utc::now(),
                retry_count: 0,
                max_retries,
                next_attempt_at: None,
                last_error: None,
            };
            let id = op.id;
            ops.push(op);
            id
        })
    }

    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_at(Utc::now()).await
    }

    /// Process every operation queued before the pass began, oldest first.
    ///
    /// At most one mutation per note is in flight, and once an operation for
    /// a note fails or is not yet due, later ones for that note wait for the
    /// next pass.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Queue: drain already in progress");
            return Ok(DrainReport {
                busy: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let pass: Vec<Uuid> = self.read()?.iter().map(|op| op.id).collect();
        if pass.is_empty() {
            return Ok(DrainReport::default());
        }
        log::info!("Queue: draining {} operations", pass.len());

        let mut report = DrainReport::default();
        let mut blocked: HashSet<NoteId> = HashSet::new();
        let mut remote_snapshot: Option<Vec<Note>> = None;

        for op_id in pass {
            // Re-read: the op may have been coalesced away or rewritten
            let Some(op) = self.read()?.into_iter().find(|op| op.id == op_id) else {
                continue;
            };

            if blocked.contains(&op.note_id) || !op.is_due(now) {
                blocked.insert(op.note_id);
                report.deferred += 1;
                continue;
            }

            match self.attempt(&op, &mut remote_snapshot).await {
                Ok(attempt) => {
                    match attempt {
                        Attempt::Applied => report.succeeded += 1,
                        Attempt::Vacuous => report.skipped += 1,
                    }
                    self.complete(&op)?;
                }
                Err(e) => {
                    blocked.insert(op.note_id);
                    if self.fail(&op, &e, now)? {
                        report.failed += 1;
                        report.failed_notes.push(op.note_id);
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        log::info!(
            "Queue: pass done, succeeded={}, skipped={}, retried={}, failed={}, deferred={}",
            report.succeeded,
            report.skipped,
            report.retried,
            report.failed,
            report.deferred,
        );
        Ok(report)
    }

    async fn attempt(
        &self,
        op: &QueuedOperation,
        remote_snapshot: &mut Option<Vec<Note>>,
    ) -> std::result::Result<Attempt, AttemptError> {
        match op.op_type {
            OperationType::Delete => match self.remote.delete(op.note_id).await {
                Ok(()) => Ok(Attempt::Applied),
                Err(RemoteError::NotFound(_)) => {
                    log::debug!("Queue: note {} already gone remotely", op.note_id);
                    Ok(Attempt::Vacuous)
                }
                Err(e) => Err(e.into()),
            },
            OperationType::Create | OperationType::Update => {
                let exists = self.repo.contains(op.note_id)?;
                let Some(note) = op.payload.as_ref().filter(|_| exists) else {
                    log::debug!("Queue: note {} no longer exists locally, skipping {:?}", op.note_id, op.op_type);
                    return Ok(Attempt::Vacuous);
                };

                if op.op_type == OperationType::Update {
                    return match self.remote.update(note.id, &NotePatch::from_note(note)).await {
                        Ok(()) => Ok(Attempt::Applied),
                        Err(RemoteError::NotFound(_)) => {
                            // Reconciliation pushes it as a local-only note
                            log::debug!("Queue: note {} missing remotely, leaving to reconciliation", op.note_id);
                            Ok(Attempt::Vacuous)
                        }
                        Err(e) => Err(e.into()),
                    };
                }

                if remote_snapshot.is_none() {
                    *remote_snapshot = Some(self.remote.fetch_all(&self.owner_id).await?);
                }
                let existing = remote_snapshot
                    .as_ref()
                    .and_then(|notes| notes.iter().find(|n| n.id == note.id || n.unique_id == note.unique_id))
                    .map(|n| n.id);

                match existing {
                    Some(remote_id) => {
                        log::info!("Queue: note {} already exists remotely, sending update", op.note_id);
                        self.remote.update(remote_id, &NotePatch::from_note(note)).await?;
                    }
                    None => {
                        let created = self.remote.create(&self.owner_id, note).await?;
                        if let Some(notes) = remote_snapshot.as_mut() {
                            notes.push(created);
                        }
                    }
                }
                Ok(Attempt::Applied)
            }
        }
    }

    /// Remove a finished operation unless a newer payload was coalesced into
    /// it while the call was in flight.
    fn complete(&self, sent: &QueuedOperation) -> Result<()> {
        self.modify(|ops| {
            let Some(pos) = ops.iter().position(|op| op.id == sent.id) else {
                return;
            };
            if ops[pos].payload == sent.payload {
                ops.remove(pos);
                return;
            }
            let current = &mut ops[pos];
            log::debug!("Queue: note {} changed during send, keeping newer payload", current.note_id);
            if current.op_type == OperationType::Create {
                current.op_type = OperationType::Update;
            }
            current.retry_count = 0;
            current.next_attempt_at = None;
            current.last_error = None;
        })
    }

    /// Record a failed attempt. Returns `true` when retries are exhausted.
    fn fail(&self, sent: &QueuedOperation, error: &AttemptError, now: DateTime<Utc>) -> Result<bool> {
        let config = &self.config;
        let exhausted = self.modify(|ops| {
            let pos = ops.iter().position(|op| op.id == sent.id)?;
            let op = &mut ops[pos];
            op.retry_count += 1;
            op.last_error = Some(error.to_string());

            if op.retry_count >= op.max_retries {
                return Some(ops.remove(pos));
            }

            let delay = config.backoff(op.retry_count);
            op.next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
            log::warn!(
                "Queue: {:?} for note {} failed (attempt {}/{}), retrying in {:?}: {}",
                op.op_type,
                op.note_id,
                op.retry_count,
                op.max_retries,
                delay,
                error,
            );
            None
        })?;

        match exhausted {
            Some(op) => {
                log::error!(
                    "Queue: {:?} for note {} failed after {} attempts: {}",
                    op.op_type,
                    op.note_id,
                    op.retry_count,
                    error,
                );
                self.events.emit(SyncEvent::SyncOperationFailed { operation: op });
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
