mod common;

use chrono::{Duration, Utc};

use common::{create_test_context, drain_events, test_config, OWNER};
use nous_sync::remote::RemoteCall;
use nous_sync::storage::{keys, LocalStore};
use nous_sync::sync::{ConflictStrategy, SyncEvent, WarningLevel, MERGE_SEPARATOR};
use nous_sync::{MemoryRemote, MemoryStore, Note};

#[tokio::test]
async fn offline_edits_reach_remote_as_one_update() {
    let store = MemoryStore::new();
    let remote = MemoryRemote::new();
    let context = create_test_context(&store, &remote, test_config(ConflictStrategy::KeepLocal));
    context.start(true).unwrap();

    let note = Note::new(7, "Plan", "draft 0");
    context.repo().put(&note, "seed").unwrap();
    remote.seed(OWNER, note);

    let orchestrator = context.orchestrator();
    orchestrator.handle_offline(Utc::now()).unwrap();
    for content in ["draft 1", "draft 2", "draft 3"] {
        let mut edited = context.repo().get(7).unwrap().unwrap();
        edited.set_content(content);
        orchestrator.save(edited).await.unwrap();
    }
    assert_eq!(context.queue().len().unwrap(), 1);
    assert!(remote.calls().is_empty());

    orchestrator.handle_online(Utc::now()).await.unwrap();

    let updates: Vec<_> = remote
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            RemoteCall::Update(7, patch) => Some(patch),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].content.as_deref(), Some("draft 3"));
    assert_eq!(remote.note(7).unwrap().content, "draft 3");
    assert!(context.queue().is_empty().unwrap());
}

#[tokio::test]
async fn merge_concatenates_and_unions_on_both_sides() {
    let store = MemoryStore::new();
    let remote = MemoryRemote::new();
    let context = create_test_context(&store, &remote, test_config(ConflictStrategy::Merge));
    context.start(true).unwrap();

    let t = Utc::now() - Duration::minutes(1);
    let mut local = Note::new(42, "Local title", "local body")
        .with_tags(["work", "ideas"])
        .with_category(Some(5));
    local.unique_id = "ab12cd34".to_string();
    local.updated_at = t + Duration::seconds(10);
    context.repo().put(&local, "seed").unwrap();

    let mut theirs = Note::new(42, "Remote title", "remote body")
        .with_tags(["ideas", "later"])
        .with_category(None);
    theirs.unique_id = "ab12cd34".to_string();
    theirs.updated_at = t;
    remote.seed(OWNER, theirs);

    let result = context.orchestrator().reconcile().await.unwrap();
    assert_eq!(result.conflicts_resolved, 1);

    let expected = format!("local body{}remote body", MERGE_SEPARATOR);
    let merged_local = context.repo().get(42).unwrap().unwrap();
    let merged_remote = remote.note(42).unwrap();
    for merged in [&merged_local, &merged_remote] {
        assert_eq!(merged.content, expected);
        assert_eq!(merged.title, "Local title");
        assert_eq!(merged.category, Some(5));
        assert!(["work", "ideas", "later"].iter().all(|tag| merged.tags.contains(*tag)));
        assert!(merged.updated_at >= local.updated_at);
    }
}

#[tokio::test]
async fn snapshot_over_quota_prunes_then_succeeds() {
    let store = MemoryStore::new();
    let remote = MemoryRemote::new();
    let context = create_test_context(&store, &remote, test_config(ConflictStrategy::KeepLocal));
    let mut events = context.events().subscribe();

    for id in 1..=3 {
        let note = Note::new(id, format!("note {}", id), "x".repeat(400));
        context.repo().put(&note, "seed").unwrap();
    }
    store.set("cache.search", serde_json::json!({"query": "note"})).unwrap();
    let backups = context.backups();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(backups.snapshot().unwrap());
    }
    let newest = ids.last().unwrap().clone();

    let key = keys::backup(&newest);
    let value = store.get(&key).unwrap().unwrap();
    let backup_size = (key.len() + value.to_string().len()) as u64;
    let used = store.usage().unwrap().used;
    store.set_quota(used + backup_size / 2);

    let id = backups.snapshot().unwrap();

    let remaining: Vec<String> = backups.list_snapshots().unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(remaining, vec![id, newest]);
    assert!(store.get("cache.search").unwrap().is_none());
    assert_eq!(context.repo().list().unwrap().len(), 3);
    assert!(!drain_events(&mut events).iter().any(|e| matches!(
        e,
        SyncEvent::StorageWarning {
            level: WarningLevel::Critical,
            ..
        }
    )));
}

#[tokio::test]
async fn crash_then_restore_recovers_notes() {
    let store = MemoryStore::new();
    let remote = MemoryRemote::new();
    let config = test_config(ConflictStrategy::KeepLocal);

    let first = create_test_context(&store, &remote, config.clone());
    first.start(false).unwrap();
    first.orchestrator().create_note("kept", "safe").await.unwrap();
    first.backups().snapshot().unwrap();
    // No stop(): the context dies with its heartbeat still in place
    store.remove(keys::NOTES).unwrap();

    let second = create_test_context(&store, &remote, config);
    let later = Utc::now() + Duration::minutes(10);
    let crash = second.backups().detect_crash(later).unwrap().unwrap();
    assert!(crash.backups_available >= 1);

    let report = second.backups().restore(None).unwrap();
    assert_eq!(report.notes_restored, 1);
    assert_eq!(second.repo().list().unwrap()[0].title, "kept");
}
