pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod coordinator;
pub mod events;
pub mod metadata;
pub mod queue;
pub mod scheduler;

mod manager;

pub use config::{
    BackupConfig, ConfigError, ConflictStrategy, QueueConfig, SyncConfig, SyncResult, SyncStatus,
    TabConfig,
};
pub use conflict::{ConflictRecord, ReconcilePlan, Resolution, MERGE_SEPARATOR};
pub use connectivity::{check_reachable, Connectivity, ConnectivityMonitor};
pub use coordinator::{
    BroadcastChannel, BroadcastMessage, ChangeKind, Coordinator, CoordinatorError,
    StorageBroadcastChannel, TabRegistration,
};
pub use events::{EventBus, SyncEvent, WarningLevel};
pub use manager::{SyncError, SyncOrchestrator};
pub use metadata::{NoteSyncState, StateCounts, SyncStateTracker};
pub use queue::{DrainReport, OperationQueue, OperationType, QueuedOperation};
pub use scheduler::{start_sync_scheduler, SchedulerServices, SyncScheduler, SyncSchedulerMessage};
