use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::storage::{Note, NoteId};

use super::{NotePatch, RemoteError, RemoteStore};

/// Call recorded by `MemoryRemote`
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchAll,
    Create(NoteId),
    Update(NoteId, NotePatch),
    Delete(NoteId),
}

#[derive(Default)]
struct State {
    /// Kept as a list so a duplicate create stays observable
    notes: Vec<(String, Note)>,
    calls: Vec<RemoteCall>,
    failing: HashSet<NoteId>,
}

/// In-process remote store used for offline demos and tests.
///
/// Clones share state. Connectivity can be toggled and individual notes can be
/// made to fail every mutation.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every mutation of `note_id` fail with a network error
    pub fn fail_note(&self, note_id: NoteId) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(note_id);
        }
    }

    /// Place a note directly, bypassing the call journal
    pub fn seed(&self, owner_id: &str, note: Note) {
        if let Ok(mut state) = self.state.lock() {
            state.notes.retain(|(_, n)| n.id != note.id);
            state.notes.push((owner_id.to_string(), note));
        }
    }

    pub fn notes(&self) -> Vec<Note> {
        self.state
            .lock()
            .map(|s| s.notes.iter().map(|(_, n)| n.clone()).collect())
            .unwrap_or_default()
    }

    pub fn note(&self, note_id: NoteId) -> Option<Note> {
        self.notes().into_iter().find(|n| n.id == note_id)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::NetworkUnavailable("remote state poisoned".to_string()))
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::NetworkUnavailable("offline".to_string()))
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Note>, RemoteError> {
        self.check_available()?;
        let mut state = self.state()?;
        state.calls.push(RemoteCall::FetchAll);
        Ok(state
            .notes
            .iter()
            .filter(|(owner, _)| owner == owner_id)
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn create(&self, owner_id: &str, note: &Note) -> Result<Note, RemoteError> {
        self.check_available()?;
        let mut state = self.state()?;
        state.calls.push(RemoteCall::Create(note.id));
        if state.failing.contains(&note.id) {
            return Err(RemoteError::NetworkUnavailable(format!("create {} failed", note.id)));
        }
        state.notes.push((owner_id.to_string(), note.clone()));
        Ok(note.clone())
    }

    async fn update(&self, note_id: NoteId, patch: &NotePatch) -> Result<(), RemoteError> {
        self.check_available()?;
        let mut state = self.state()?;
        state.calls.push(RemoteCall::Update(note_id, patch.clone()));
        if state.failing.contains(&note_id) {
            return Err(RemoteError::NetworkUnavailable(format!("update {} failed", note_id)));
        }
        let note = state
            .notes
            .iter_mut()
            .map(|(_, n)| n)
            .find(|n| n.id == note_id)
            .ok_or(RemoteError::NotFound(note_id))?;
        patch.apply_to(note);
        Ok(())
    }

    async fn delete(&self, note_id: NoteId) -> Result<(), RemoteError> {
        self.check_available()?;
        let mut state = self.state()?;
        state.calls.push(RemoteCall::Delete(note_id));
        if state.failing.contains(&note_id) {
            return Err(RemoteError::NetworkUnavailable(format!("delete {} failed", note_id)));
        }
        let before = state.notes.len();
        state.notes.retain(|(_, n)| n.id != note_id);
        if state.notes.len() == before {
            return Err(RemoteError::NotFound(note_id));
        }
        Ok(())
    }
}
