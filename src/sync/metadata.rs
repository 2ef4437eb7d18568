use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::storage::NoteId;

use super::manager::SyncError;

/// Where a single note sits in the sync lifecycle
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoteSyncState {
    #[default]
    Clean,
    LocallyModified,
    Queued,
    Syncing,
    Conflicted,
    Resolved,
    Failed,
}

impl NoteSyncState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// A fresh local edit is accepted from any state, and re-entering the
    /// current state is a no-op.
    pub fn can_transition_to(self, next: NoteSyncState) -> bool {
        use NoteSyncState::*;

        if self == next || next == LocallyModified {
            return true;
        }
        matches!(
            (self, next),
            (Clean, Conflicted)
                | (Clean, Queued)
                | (LocallyModified, Queued)
                | (LocallyModified, Conflicted)
                | (Queued, Syncing)
                | (Syncing, Clean)
                | (Syncing, Conflicted)
                | (Syncing, Failed)
                | (Syncing, Queued)
                | (Conflicted, Resolved)
                | (Resolved, Clean)
                | (Resolved, Queued)
                | (Failed, Queued)
                | (Failed, Conflicted)
                | (Failed, Clean)
        )
    }
}

impl fmt::Display for NoteSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NoteSyncState::Clean => "clean",
            NoteSyncState::LocallyModified => "locally-modified",
            NoteSyncState::Queued => "queued",
            NoteSyncState::Syncing => "syncing",
            NoteSyncState::Conflicted => "conflicted",
            NoteSyncState::Resolved => "resolved",
            NoteSyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Number of tracked notes per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCounts {
    pub locally_modified: usize,
    pub queued: usize,
    pub syncing: usize,
    pub conflicted: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// Per-note state machine. Notes not tracked are `Clean`.
#[derive(Default)]
pub struct SyncStateTracker {
    states: Mutex<HashMap<NoteId, NoteSyncState>>,
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, note_id: NoteId) -> NoteSyncState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&note_id).copied())
            .unwrap_or_default()
    }

    /// Move a note to `next`, returning the state it left.
    pub fn transition(&self, note_id: NoteId, next: NoteSyncState) -> Result<NoteSyncState, SyncError> {
        let mut states = self.states.lock().map_err(|_| SyncError::LockPoisoned)?;
        let current = states.get(&note_id).copied().unwrap_or_default();

        if !current.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                note_id,
                from: current,
                to: next,
            });
        }

        if next == NoteSyncState::Clean {
            states.remove(&note_id);
        } else {
            states.insert(note_id, next);
        }
        if current != next {
            log::debug!("Sync: note {} {} -> {}", note_id, current, next);
        }
        Ok(current)
    }

    /// Stop tracking a note, e.g. after it was deleted
    pub fn forget(&self, note_id: NoteId) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&note_id);
        }
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        let Ok(states) = self.states.lock() else {
            return counts;
        };
        for state in states.values() {
            match state {
                NoteSyncState::Clean => {}
                NoteSyncState::LocallyModified => counts.locally_modified += 1,
                NoteSyncState::Queued => counts.queued += 1,
                NoteSyncState::Syncing => counts.syncing += 1,
                NoteSyncState::Conflicted => counts.conflicted += 1,
                NoteSyncState::Resolved => counts.resolved += 1,
                NoteSyncState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NoteSyncState::*;

    fn walk(tracker: &SyncStateTracker, note_id: NoteId, path: &[NoteSyncState]) {
        for state in path {
            tracker.transition(note_id, *state).unwrap();
        }
    }

    #[test]
    fn test_happy_path() {
        let tracker = SyncStateTracker::new();
        walk(&tracker, 1, &[LocallyModified, Queued, Syncing, Clean]);
        assert_eq!(tracker.get(1), Clean);
        assert_eq!(tracker.counts(), StateCounts::default());
    }

    #[test]
    fn test_conflict_path() {
        let tracker = SyncStateTracker::new();
        walk(&tracker, 2, &[Conflicted, Resolved]);
        assert_eq!(tracker.counts().resolved, 1);
        tracker.transition(2, Clean).unwrap();
        assert_eq!(tracker.get(2), Clean);
    }

    #[test]
    fn test_edited_note_can_enter_conflict() {
        let tracker = SyncStateTracker::new();
        walk(&tracker, 4, &[LocallyModified, Conflicted, Resolved, Clean]);
        assert_eq!(tracker.counts(), StateCounts::default());
    }

    #[test]
    fn test_rejects_skipping_the_queue() {
        let tracker = SyncStateTracker::new();
        tracker.transition(3, LocallyModified).unwrap();
        let err = tracker.transition(3, Syncing).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidTransition { from: LocallyModified, to: Syncing, .. }
        ));
        assert_eq!(tracker.get(3), LocallyModified);
    }

    #[test]
    fn test_clean_cannot_jump_to_resolved() {
        assert!(!Clean.can_transition_to(Resolved));
        assert!(Failed.can_transition_to(LocallyModified));
    }

    #[test]
    fn test_counts() {
        let tracker = SyncStateTracker::new();
        walk(&tracker, 1, &[LocallyModified, Queued]);
        walk(&tracker, 2, &[LocallyModified, Queued]);
        tracker.transition(3, Conflicted).unwrap();
        let counts = tracker.counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.conflicted, 1);
    }
}
