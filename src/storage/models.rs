use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Join key shared by the local and remote stores
pub type NoteId = u64;

/// Length of a freshly generated `unique_id`
const UNIQUE_ID_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    /// Opaque identity that survives re-identification across stores
    pub unique_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub size: u64,
}

impl Note {
    pub fn new(id: NoteId, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        let content = content.into();
        Self {
            id,
            unique_id: generate_unique_id(),
            title: title.into(),
            size: content.len() as u64,
            content,
            tags: BTreeSet::new(),
            category: None,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: Option<u64>) -> Self {
        self.category = category;
        self
    }

    /// Replace the body and keep `size` in step with it
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.size = self.content.len() as u64;
    }

    /// Advance `updated_at` to `now`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// True when the user-visible text of two notes differs.
    pub fn text_differs(&self, other: &Note) -> bool {
        self.content != other.content || self.title != other.title
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// Generate a short lowercase alphanumeric identity like `ab12cd34`
pub fn generate_unique_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UNIQUE_ID_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// One accepted local write, kept in the per-note history sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub ts: DateTime<Utc>,
    pub context_id: String,
    pub content_hash: String,
    pub title: String,
    pub size: u64,
}

impl HistoryEntry {
    pub fn for_note(note: &Note, context_id: &str) -> Self {
        Self {
            ts: note.updated_at,
            context_id: context_id.to_string(),
            content_hash: note.content_hash(),
            title: note.title.clone(),
            size: note.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_unique_id_shape() {
        let id = generate_unique_id();
        assert_eq!(id.len(), UNIQUE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut note = Note::new(1, "t", "c");
        let original = note.updated_at;

        note.touch(original - Duration::seconds(30));
        assert_eq!(note.updated_at, original);

        note.touch(original + Duration::seconds(30));
        assert_eq!(note.updated_at, original + Duration::seconds(30));
    }

    #[test]
    fn test_set_content_tracks_size() {
        let mut note = Note::new(1, "t", "");
        note.set_content("hello");
        assert_eq!(note.size, 5);
    }

    #[test]
    fn test_note_serializes_camel_case() {
        let note = Note::new(7, "Title", "Body").with_tags(["a", "b"]);
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("uniqueId").is_some());
        assert!(json.get("updatedAt").is_some());
        assert_eq!(json["tags"], serde_json::json!(["a", "b"]));
    }
}
