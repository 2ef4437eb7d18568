use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

use super::local::{entry_size, LocalStore, Result, StorageChange, StorageError, StorageUsage};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// File extension for stored entries
const ENTRY_EXT: &str = "json";

/// Directory-backed local store: one compact JSON file per key.
///
/// Keys are percent-encoded into file names. Writes go through a temp file and
/// a rename so a crash never leaves a half-written entry behind. Change
/// notifications reach every subscriber holding this instance; other
/// processes sharing the directory see the data but not the notifications.
pub struct FileStore {
    base_path: PathBuf,
    quota: u64,
    changes: broadcast::Sender<StorageChange>,
    /// Serializes quota accounting with the write that depends on it
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_path: PathBuf, quota: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            base_path,
            quota,
            changes,
            write_lock: Mutex::new(()),
        }
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        dirs::data_local_dir()
            .map(|p| p.join("nous-sync"))
            .ok_or_else(|| StorageError::NotFound("local data directory".to_string()))
    }

    /// Initialize the store directory
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.entries_dir())?;
        Ok(())
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn entries_dir(&self) -> PathBuf {
        self.base_path.join("store")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir()
            .join(format!("{}.{}", urlencoding::encode(key), ENTRY_EXT))
    }

    fn stored_size(&self, key: &str) -> Result<u64> {
        let path = self.entry_path(key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(key.len() as u64 + meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn total_used(&self) -> Result<u64> {
        let mut used = 0;
        for key in self.keys()? {
            used += self.stored_size(&key)?;
        }
        Ok(used)
    }

    fn publish(&self, key: &str, new_value: Option<Value>) {
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value,
        });
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.entry_path(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        {
            let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
            let current = self.total_used()?;
            let replaced = self.stored_size(key)?;
            let needed = entry_size(key, &value);
            if current - replaced + needed > self.quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: self.quota.saturating_sub(current - replaced),
                });
            }

            fs::create_dir_all(self.entries_dir())?;
            let path = self.entry_path(key);
            let tmp_path = path.with_extension("tmp");
            fs::write(&tmp_path, serde_json::to_string(&value)?)?;
            fs::rename(&tmp_path, &path)?;
        }
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.publish(key, None);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let dir = self.entries_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |e| e == ENTRY_EXT) {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match urlencoding::decode(stem) {
                    Ok(key) => keys.push(key.into_owned()),
                    Err(e) => log::warn!("FileStore: skipping undecodable entry {}: {}", stem, e),
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn usage(&self) -> Result<StorageUsage> {
        Ok(StorageUsage {
            used: self.total_used()?,
            quota: self.quota,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store(quota: u64) -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf(), quota);
        store.init().unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_set_get_remove() {
        let (store, _temp) = create_test_store(1024 * 1024);

        store.set("notes", json!([{"id": 1}])).unwrap();
        assert_eq!(store.get("notes").unwrap(), Some(json!([{"id": 1}])));

        store.remove("notes").unwrap();
        assert_eq!(store.get("notes").unwrap(), None);
        // Removing twice is fine
        store.remove("notes").unwrap();
    }

    #[test]
    fn test_keys_round_trip_through_file_names() {
        let (store, _temp) = create_test_store(1024 * 1024);

        store.set("backup.1700000000000", json!({})).unwrap();
        store.set("history/7", json!([])).unwrap();

        assert_eq!(
            store.keys().unwrap(),
            vec!["backup.1700000000000".to_string(), "history/7".to_string()]
        );
    }

    #[test]
    fn test_usage_matches_entry_size() {
        let (store, _temp) = create_test_store(1024);
        let value = json!({"title": "hello"});
        store.set("k", value.clone()).unwrap();

        let usage = store.usage().unwrap();
        assert_eq!(usage.used, entry_size("k", &value));
        assert_eq!(usage.quota, 1024);
    }

    #[test]
    fn test_quota_exceeded() {
        let (store, _temp) = create_test_store(16);
        let err = store.set("k", json!("a string that does not fit")).unwrap_err();
        assert!(err.is_quota());
        assert!(store.keys().unwrap().is_empty());
    }
}
