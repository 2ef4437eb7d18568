use super::keys;
use super::local::{get_json, set_json, Result, SharedLocalStore};
use super::models::{HistoryEntry, Note, NoteId};

/// Default number of history entries kept per note
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Typed access to the primary note collection and its edit-history sidecars.
#[derive(Clone)]
pub struct NoteRepository {
    store: SharedLocalStore,
    history_limit: usize,
}

impl NoteRepository {
    pub fn new(store: SharedLocalStore, history_limit: usize) -> Self {
        Self {
            store,
            history_limit,
        }
    }

    pub fn store(&self) -> &SharedLocalStore {
        &self.store
    }

    pub fn list(&self) -> Result<Vec<Note>> {
        Ok(get_json(self.store.as_ref(), keys::NOTES)?.unwrap_or_default())
    }

    pub fn replace_all(&self, notes: &[Note]) -> Result<()> {
        set_json(self.store.as_ref(), keys::NOTES, &notes)
    }

    pub fn get(&self, note_id: NoteId) -> Result<Option<Note>> {
        Ok(self.list()?.into_iter().find(|n| n.id == note_id))
    }

    pub fn contains(&self, note_id: NoteId) -> Result<bool> {
        Ok(self.list()?.iter().any(|n| n.id == note_id))
    }

    /// Smallest id not yet used locally
    pub fn next_id(&self) -> Result<NoteId> {
        Ok(self.list()?.iter().map(|n| n.id).max().map_or(1, |max| max + 1))
    }

    /// Unguarded read-modify-write of the collection plus a history entry.
    /// Returns `true` if the note was new to this store.
    pub fn put(&self, note: &Note, context_id: &str) -> Result<bool> {
        let mut notes = self.list()?;
        let created = upsert(&mut notes, note.clone());
        self.replace_all(&notes)?;
        self.append_history(note, context_id)?;
        Ok(created)
    }

    /// Remove a note and its history sidecar, returning the removed note.
    pub fn remove(&self, note_id: NoteId) -> Result<Option<Note>> {
        let mut notes = self.list()?;
        let Some(pos) = notes.iter().position(|n| n.id == note_id) else {
            return Ok(None);
        };
        let removed = notes.remove(pos);
        self.replace_all(&notes)?;
        self.store.remove(&keys::history(note_id))?;
        Ok(Some(removed))
    }

    pub fn history(&self, note_id: NoteId) -> Result<Vec<HistoryEntry>> {
        Ok(get_json(self.store.as_ref(), &keys::history(note_id))?.unwrap_or_default())
    }

    pub fn set_history(&self, note_id: NoteId, entries: &[HistoryEntry]) -> Result<()> {
        set_json(self.store.as_ref(), &keys::history(note_id), &entries)
    }

    pub fn append_history(&self, note: &Note, context_id: &str) -> Result<()> {
        let mut entries = self.history(note.id)?;
        entries.push(HistoryEntry::for_note(note, context_id));
        if entries.len() > self.history_limit {
            let excess = entries.len() - self.history_limit;
            entries.drain(..excess);
        }
        self.set_history(note.id, &entries)
    }

    /// Drop every history sidecar whose note is not in `keep`
    pub fn prune_history_except(&self, keep: &[NoteId]) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if let Some(note_id) = keys::history_note_id(&key) {
                if !keep.contains(&note_id) {
                    self.store.remove(&key)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Insert or replace `note` by id. Returns `true` when inserted.
pub fn upsert(notes: &mut Vec<Note>, note: Note) -> bool {
    match notes.iter_mut().find(|n| n.id == note.id) {
        Some(existing) => {
            *existing = note;
            false
        }
        None => {
            notes.push(note);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use std::sync::Arc;

    fn create_test_repo(limit: usize) -> NoteRepository {
        NoteRepository::new(Arc::new(MemoryStore::new()), limit)
    }

    #[test]
    fn test_put_and_get() {
        let repo = create_test_repo(DEFAULT_HISTORY_LIMIT);
        let note = Note::new(1, "First", "body");

        assert!(repo.put(&note, "ctx").unwrap());
        assert!(!repo.put(&note, "ctx").unwrap());

        assert_eq!(repo.list().unwrap().len(), 1);
        assert_eq!(repo.get(1).unwrap().unwrap().title, "First");
        assert_eq!(repo.next_id().unwrap(), 2);
    }

    #[test]
    fn test_history_is_capped() {
        let repo = create_test_repo(3);
        let mut note = Note::new(5, "t", "v0");

        for i in 1..=5 {
            note.set_content(format!("v{}", i));
            repo.put(&note, "ctx").unwrap();
        }

        let history = repo.history(5).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().content_hash, note.content_hash());
    }

    #[test]
    fn test_remove_drops_sidecar() {
        let repo = create_test_repo(DEFAULT_HISTORY_LIMIT);
        repo.put(&Note::new(1, "a", "b"), "ctx").unwrap();
        repo.put(&Note::new(2, "c", "d"), "ctx").unwrap();

        let removed = repo.remove(1).unwrap();
        assert_eq!(removed.map(|n| n.id), Some(1));
        assert!(repo.history(1).unwrap().is_empty());
        assert_eq!(repo.history(2).unwrap().len(), 1);
        assert!(repo.remove(1).unwrap().is_none());
    }
}
