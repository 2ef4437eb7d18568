//! Client-side note synchronization: local-first writes, an offline
//! operation queue, cross-context coordination, conflict resolution and
//! crash recovery backups.

pub mod context;
pub mod remote;
pub mod storage;
pub mod sync;

pub use context::SyncContext;
pub use remote::{HttpRemote, MemoryRemote, RemoteError, RemoteStore, SharedRemote};
pub use storage::{
    BackupManager, FileStore, LocalStore, MemoryStore, Note, NoteId, NoteRepository, SharedLocalStore,
    StorageError,
};
pub use sync::{
    ConflictStrategy, EventBus, OperationQueue, SyncConfig, SyncError, SyncEvent, SyncOrchestrator,
    SyncStatus,
};
