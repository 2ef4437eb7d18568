use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Key not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Same-origin change notification. `new_value` is `None` for removals.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<Value>,
}

/// Byte usage against the store's quota
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageUsage {
    pub used: u64,
    pub quota: u64,
}

impl StorageUsage {
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 0.0;
        }
        self.used as f64 / self.quota as f64
    }
}

/// Device-local persistent key/value store shared by every context of the
/// same origin.
///
/// Writes are visible to all contexts holding the same store, and each
/// mutation is published to every subscriber.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Fails with `StorageError::QuotaExceeded` without mutating anything when
    /// the write does not fit.
    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;

    fn usage(&self) -> Result<StorageUsage>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub type SharedLocalStore = Arc<dyn LocalStore>;

/// Typed read of a JSON key. Missing keys read as `None`.
pub fn get_json<T: serde::de::DeserializeOwned>(store: &dyn LocalStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: serde::Serialize>(store: &dyn LocalStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_value(value)?)
}

/// Size a value occupies in the store: key plus serialized value
pub(crate) fn entry_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}
