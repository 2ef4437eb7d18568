use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{DEFAULT_HISTORY_LIMIT, DEFAULT_QUOTA_BYTES};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    Write(#[from] toml::ser::Error),
}

/// How conflicting edits are settled during reconciliation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Local copy overwrites the remote one
    #[default]
    KeepLocal,
    /// Remote copy overwrites the local one
    KeepRemote,
    /// Concatenate bodies, union tags
    Merge,
    /// Surface the conflict and wait for the user
    Manual,
}

/// Sync configuration for one application instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Owner the remote collection belongs to
    pub owner_id: String,
    pub conflict_strategy: ConflictStrategy,
    /// Lightweight reconciliation period while online
    pub reconcile_interval_secs: u64,
    /// Edit-history entries kept per note
    pub history_limit: usize,
    /// Byte budget for file-backed local storage
    pub storage_quota_bytes: u64,
    pub queue: QueueConfig,
    pub tabs: TabConfig,
    pub backup: BackupConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            owner_id: "local".to_string(),
            conflict_strategy: ConflictStrategy::KeepLocal,
            reconcile_interval_secs: 60,
            history_limit: DEFAULT_HISTORY_LIMIT,
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
            queue: QueueConfig::default(),
            tabs: TabConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// `min(base * 2^retry_count, cap)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabConfig {
    pub heartbeat_interval_secs: u64,
    /// A registration older than this counts as inactive and is pruned
    pub liveness_window_secs: u64,
}

impl TabConfig {
    pub fn liveness_window(&self) -> chrono::Duration {
        seconds_window(self.liveness_window_secs)
    }
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            liveness_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub interval_secs: u64,
    pub max_backups: usize,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub heartbeat_interval_secs: u64,
    /// A stale heartbeat older than this without a clean-shutdown marker means a crash
    pub crash_threshold_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_backups: 10,
            warning_ratio: 0.8,
            critical_ratio: 0.95,
            heartbeat_interval_secs: 10,
            crash_threshold_secs: 300,
        }
    }
}

impl BackupConfig {
    pub fn crash_threshold(&self) -> chrono::Duration {
        seconds_window(self.crash_threshold_secs)
    }
}

/// Largest whole-second span a `chrono::Duration` can hold
const MAX_WINDOW_SECS: u64 = (i64::MAX / 1000) as u64;

/// Config-supplied second counts are clamped rather than trusted
fn seconds_window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl SyncConfig {
    /// Get the config file path inside a data directory
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("sync.toml")
    }

    /// Load from `sync.toml`, falling back to defaults when the file is absent
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        fs::create_dir_all(data_dir)?;
        let content = toml::to_string_pretty(self)?;
        fs::write(Self::path(data_dir), content)?;
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Snapshot of orchestrator state for display
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub pending_operations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub conflicts: usize,
    pub locally_modified: usize,
    pub queued: usize,
    pub failed: usize,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Remote-only or remote-newer notes written locally
    pub notes_pulled: usize,
    /// Local-only notes sent to the remote
    pub notes_pushed: usize,
    pub conflicts_resolved: usize,
    /// Conflicts left for the user (manual strategy)
    pub conflicts_pending: usize,
    pub duration_ms: u64,
}
