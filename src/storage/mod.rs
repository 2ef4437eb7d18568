pub mod backup;
mod file_storage;
pub mod keys;
mod local;
mod memory;
mod models;
mod notes;
pub mod quota;

pub use backup::{BackupError, BackupInfo, BackupManager, BackupSnapshot, CrashReport, RestoreReport};
pub use file_storage::FileStore;
pub use local::{
    get_json, set_json, LocalStore, SharedLocalStore, StorageChange, StorageError, StorageUsage,
};
pub use memory::{MemoryStore, DEFAULT_QUOTA_BYTES};
pub use models::*;
pub use notes::{upsert, NoteRepository, DEFAULT_HISTORY_LIMIT};
pub use quota::{PruneReport, QuotaStatus};
