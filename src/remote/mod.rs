//! Network-backed shared document store.

pub mod http;
pub mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::storage::{Note, NoteId};

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Remote conflict on note {0}")]
    Conflict(NoteId),
    #[error("Remote note not found: {0}")]
    NotFound(NoteId),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::NetworkUnavailable(_) | RemoteError::Http(_) => true,
            RemoteError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Partial update sent to the remote. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    /// `Some(None)` clears the category
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub category: Option<Option<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NotePatch {
    /// Patch carrying every user-editable field of `note`
    pub fn from_note(note: &Note) -> Self {
        Self {
            title: Some(note.title.clone()),
            content: Some(note.content.clone()),
            tags: Some(note.tags.clone()),
            category: Some(note.category),
            archived: Some(note.archived),
            updated_at: Some(note.updated_at),
        }
    }

    pub fn apply_to(&self, note: &mut Note) {
        if let Some(title) = &self.title {
            note.title = title.clone();
        }
        if let Some(content) = &self.content {
            note.set_content(content.clone());
        }
        if let Some(tags) = &self.tags {
            note.tags = tags.clone();
        }
        if let Some(category) = self.category {
            note.category = category;
        }
        if let Some(archived) = self.archived {
            note.archived = archived;
        }
        if let Some(updated_at) = self.updated_at {
            note.updated_at = updated_at;
        }
    }
}

/// Distinguishes an explicit `null` from an absent field
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(Some)
}

/// Contract of the remote document store. Create and update must be safe to
/// retry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Note>, RemoteError>;

    async fn create(&self, owner_id: &str, note: &Note) -> Result<Note, RemoteError>;

    async fn update(&self, note_id: NoteId, patch: &NotePatch) -> Result<(), RemoteError>;

    async fn delete(&self, note_id: NoteId) -> Result<(), RemoteError>;
}

pub type SharedRemote = Arc<dyn RemoteStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut note = Note::new(1, "title", "body").with_category(Some(3));
        let patch = NotePatch {
            content: Some("new body".to_string()),
            category: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut note);

        assert_eq!(note.title, "title");
        assert_eq!(note.content, "new body");
        assert_eq!(note.size, 8);
        assert_eq!(note.category, None);
    }

    #[test]
    fn test_patch_null_category_is_explicit() {
        let cleared: NotePatch = serde_json::from_str(r#"{"category": null}"#).unwrap();
        assert_eq!(cleared.category, Some(None));

        let untouched: NotePatch = serde_json::from_str("{}").unwrap();
        assert_eq!(untouched.category, None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::NetworkUnavailable("down".into()).is_transient());
        assert!(RemoteError::Server { status: 503, message: String::new() }.is_transient());
        assert!(!RemoteError::Server { status: 400, message: String::new() }.is_transient());
        assert!(!RemoteError::NotFound(1).is_transient());
    }
}
