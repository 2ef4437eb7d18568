use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use nous_sync::remote::{HttpRemote, MemoryRemote, SharedRemote};
use nous_sync::storage::{FileStore, SharedLocalStore};
use nous_sync::{SyncConfig, SyncContext};

/// Shared state for CLI commands
pub struct App {
    pub data_dir: PathBuf,
    pub config: SyncConfig,
    pub store: SharedLocalStore,
}

impl App {
    /// Open the store under `data_dir`, or the default data directory
    pub fn new(data_dir: Option<&Path>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => FileStore::default_data_dir().context("Failed to get data directory")?,
        };

        let config = SyncConfig::load(&data_dir)
            .with_context(|| format!("Failed to load {}", SyncConfig::path(&data_dir).display()))?;

        let store = FileStore::new(data_dir.clone(), config.storage_quota_bytes);
        store.init().context("Failed to initialize local store")?;

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
        })
    }

    /// Services for commands that never reach the network
    pub fn detached(&self) -> SyncContext {
        let remote = MemoryRemote::new();
        remote.set_available(false);
        self.context(Arc::new(remote))
    }

    /// Client for a remote endpoint
    pub fn remote(&self, url: &str, token: Option<String>) -> Result<SharedRemote> {
        let remote = HttpRemote::new(url.to_string(), token)
            .with_context(|| format!("Invalid remote URL '{}'", url))?;
        Ok(Arc::new(remote))
    }

    pub fn context(&self, remote: SharedRemote) -> SyncContext {
        SyncContext::new(self.config.clone(), self.store.clone(), remote)
    }
}
