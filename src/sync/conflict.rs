//! Diffing of the local and remote note collections, and conflict resolution.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::{Note, NoteId};

use super::config::ConflictStrategy;

/// Placed between the local and remote bodies of a merged note
pub const MERGE_SEPARATOR: &str = "\n\n--- merged ---\n\n";

/// Divergent edits to the same note, alive for one reconciliation pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub local: Note,
    pub remote: Note,
    pub strategy: ConflictStrategy,
}

impl ConflictRecord {
    pub fn note_id(&self) -> NoteId {
        self.local.id
    }
}

/// What one reconciliation pass has to do
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Local strictly newer with differing text
    pub conflicts: Vec<ConflictRecord>,
    /// Present only locally
    pub push: Vec<Note>,
    /// Present only remotely
    pub pull: Vec<Note>,
    /// Remote strictly newer with differing text
    pub remote_newer: Vec<Note>,
    /// Present on both sides with nothing to do
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty() && self.push.is_empty() && self.pull.is_empty() && self.remote_newer.is_empty()
    }
}

/// Compare two collections by note id.
///
/// A note is in conflict only when the local copy is strictly newer and its
/// title or content differs. Equal timestamps and identical text never
/// conflict, and one-sided notes are plain copies.
pub fn detect(local: &[Note], remote: &[Note], strategy: ConflictStrategy) -> ReconcilePlan {
    let remote_by_id: HashMap<NoteId, &Note> = remote.iter().map(|n| (n.id, n)).collect();
    let mut plan = ReconcilePlan::default();

    for local_note in local {
        let Some(remote_note) = remote_by_id.get(&local_note.id) else {
            plan.push.push(local_note.clone());
            continue;
        };

        if !local_note.text_differs(remote_note) {
            plan.unchanged += 1;
        } else if local_note.updated_at > remote_note.updated_at {
            plan.conflicts.push(ConflictRecord {
                local: local_note.clone(),
                remote: (*remote_note).clone(),
                strategy,
            });
        } else if remote_note.updated_at > local_note.updated_at {
            plan.remote_newer.push((*remote_note).clone());
        } else {
            plan.unchanged += 1;
        }
    }

    let local_ids: HashSet<NoteId> = local.iter().map(|n| n.id).collect();
    plan.pull = remote.iter().filter(|n| !local_ids.contains(&n.id)).cloned().collect();

    plan
}

/// Both sides of a settled conflict, ready to be written back
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub local: Note,
    pub remote: Note,
}

/// Settle a conflict. `Manual` leaves it for the user and yields `None`.
///
/// The rewritten side gets an `updated_at` no earlier than `now` or either
/// input's timestamp, so it always sorts after both originals.
pub fn resolve(local: &Note, remote: &Note, strategy: ConflictStrategy, now: DateTime<Utc>) -> Option<Resolution> {
    let stamp = now.max(local.updated_at).max(remote.updated_at);

    let resolution = match strategy {
        ConflictStrategy::Manual => return None,
        ConflictStrategy::KeepLocal => Resolution {
            local: local.clone(),
            remote: adopt(remote, local, stamp),
        },
        ConflictStrategy::KeepRemote => Resolution {
            local: adopt(local, remote, stamp),
            remote: remote.clone(),
        },
        ConflictStrategy::Merge => {
            let title = if remote.updated_at > local.updated_at {
                &remote.title
            } else {
                &local.title
            };
            let content = format!("{}{}{}", local.content, MERGE_SEPARATOR, remote.content);
            let tags: BTreeSet<String> = local.tags.union(&remote.tags).cloned().collect();
            let category = local.category.or(remote.category);

            let merge_into = |target: &Note| {
                let mut merged = target.clone();
                merged.title = title.clone();
                merged.set_content(content.clone());
                merged.tags = tags.clone();
                merged.category = category;
                merged.updated_at = stamp;
                merged
            };
            Resolution {
                local: merge_into(local),
                remote: merge_into(remote),
            }
        }
    };

    Some(resolution)
}

/// `target` with the user-editable fields of `source`
fn adopt(target: &Note, source: &Note, stamp: DateTime<Utc>) -> Note {
    let mut note = target.clone();
    note.title = source.title.clone();
    note.set_content(source.content.clone());
    note.tags = source.tags.clone();
    note.category = source.category;
    note.updated_at = stamp;
    note
}
