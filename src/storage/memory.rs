use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

use super::local::{entry_size, LocalStore, Result, StorageChange, StorageError, StorageUsage};

/// Default quota, roughly what browsers grant a single origin
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// In-memory origin store. Clones share the same entries and change channel,
/// so every clone behaves like another context of the same origin.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    entries: Mutex<BTreeMap<String, Value>>,
    quota: AtomicU64,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                quota: AtomicU64::new(quota),
                changes,
            }),
        }
    }

    pub fn set_quota(&self, quota: u64) {
        self.inner.quota.store(quota, Ordering::SeqCst);
    }

    fn used(entries: &BTreeMap<String, Value>) -> u64 {
        entries.iter().map(|(k, v)| entry_size(k, v)).sum()
    }

    fn publish(&self, key: &str, new_value: Option<Value>) {
        // No subscribers is fine
        let _ = self.inner.changes.send(StorageChange {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.inner.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        {
            let mut entries = self.inner.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
            let quota = self.inner.quota.load(Ordering::SeqCst);
            let current = Self::used(&entries);
            let replaced = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
            let needed = entry_size(key, &value);
            let after = current - replaced + needed;
            if after > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(current - replaced),
                });
            }
            entries.insert(key.to_string(), value.clone());
        }
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut entries = self.inner.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
            entries.remove(key).is_some()
        };
        if removed {
            self.publish(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self.inner.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.keys().cloned().collect())
    }

    fn usage(&self) -> Result<StorageUsage> {
        let entries = self.inner.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(StorageUsage {
            used: Self::used(&entries),
            quota: self.inner.quota.load(Ordering::SeqCst),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();

        a.set("k", json!({"v": 1})).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(json!({"v": 1})));

        b.remove("k").unwrap();
        assert_eq!(a.get("k").unwrap(), None);
    }

    #[test]
    fn test_quota_rejects_without_mutating() {
        let store = MemoryStore::with_quota(20);
        store.set("a", json!("12345")).unwrap();

        let err = store.set("b", json!("this value is far too long")).unwrap_err();
        assert!(err.is_quota());
        assert_eq!(store.get("b").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_overwrite_counts_replaced_bytes() {
        let store = MemoryStore::with_quota(12);
        store.set("k", json!("1234567")).unwrap();
        // Same size as the existing value, only fits because the old one is replaced
        store.set("k", json!("7654321")).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!("7654321")));
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set("note", json!(1)).unwrap();
        store.remove("note").unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "note");
        assert_eq!(first.new_value, Some(json!(1)));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.new_value, None);
    }
}
