use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::remote::SharedRemote;
use crate::storage::{BackupManager, CrashReport, NoteRepository, SharedLocalStore};
use crate::sync::{
    start_sync_scheduler, BroadcastChannel, ConnectivityMonitor, Coordinator, EventBus, OperationQueue,
    SchedulerServices, StorageBroadcastChannel, SyncConfig, SyncError, SyncOrchestrator, SyncScheduler,
};

/// All sync services for one running context, built once and shared.
///
/// `start` performs crash detection and tab registration, `run_background`
/// spawns the timer loop, and `stop` winds everything down with a final
/// snapshot and a clean-shutdown marker.
pub struct SyncContext {
    config: SyncConfig,
    repo: NoteRepository,
    events: EventBus,
    coordinator: Arc<Coordinator>,
    queue: Arc<OperationQueue>,
    backups: Arc<BackupManager>,
    orchestrator: Arc<SyncOrchestrator>,
    connectivity: ConnectivityMonitor,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl SyncContext {
    pub fn new(config: SyncConfig, store: SharedLocalStore, remote: SharedRemote) -> Self {
        let channel = Arc::new(StorageBroadcastChannel::new(store.clone()));
        Self::with_channel(config, store, remote, channel)
    }

    /// Build with a custom cross-context channel
    pub fn with_channel(
        config: SyncConfig,
        store: SharedLocalStore,
        remote: SharedRemote,
        channel: Arc<dyn BroadcastChannel>,
    ) -> Self {
        let events = EventBus::new();
        let repo = NoteRepository::new(store.clone(), config.history_limit);
        let coordinator = Arc::new(Coordinator::new(store, channel, config.tabs.clone()));
        let queue = Arc::new(OperationQueue::new(
            repo.clone(),
            remote.clone(),
            config.owner_id.clone(),
            config.queue.clone(),
            events.clone(),
        ));
        let backups = Arc::new(BackupManager::new(
            repo.clone(),
            config.backup.clone(),
            events.clone(),
            coordinator.context_id().to_string(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.clone(),
            repo.clone(),
            remote,
            coordinator.clone(),
            queue.clone(),
            backups.clone(),
            events.clone(),
        ));

        Self {
            config,
            repo,
            events,
            coordinator,
            queue,
            backups,
            orchestrator,
            connectivity: ConnectivityMonitor::new(false),
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn repo(&self) -> &NoteRepository {
        &self.repo
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Detect an unclean previous exit, register this context and take the
    /// initial connectivity state.
    pub fn start(&self, online: bool) -> Result<Option<CrashReport>, SyncError> {
        let now = Utc::now();
        log::info!("Sync context {} starting", self.coordinator.context_id());

        let crash = self.backups.start(now)?;
        self.coordinator.register(now)?;
        if let Err(e) = self.backups.check_quota() {
            log::warn!("Sync context: initial quota check failed: {}", e);
        }

        self.connectivity.set_online_at(online, now);
        self.orchestrator.set_online(online);
        Ok(crash)
    }

    /// Report a connectivity transition. The background loop, when running,
    /// turns it into a reconnect sync or a protective snapshot.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// Spawn the timer loop. Must be called inside a tokio runtime.
    pub fn run_background(&self) -> Result<(), SyncError> {
        let mut scheduler = self.scheduler.lock().map_err(|_| SyncError::LockPoisoned)?;
        if scheduler.is_some() {
            log::debug!("Sync context: background loop already running");
            return Ok(());
        }
        let services = SchedulerServices {
            orchestrator: self.orchestrator.clone(),
            coordinator: self.coordinator.clone(),
            backups: self.backups.clone(),
            connectivity: self.connectivity.subscribe(),
        };
        *scheduler = Some(start_sync_scheduler(services, &self.config));
        Ok(())
    }

    /// Ask the background loop for an immediate drain and reconcile
    pub fn request_sync(&self) {
        if let Ok(scheduler) = self.scheduler.lock() {
            if let Some(scheduler) = scheduler.as_ref() {
                scheduler.sync_now();
            }
        }
    }

    /// Stop the loop, take a final snapshot, leave the registry and mark the
    /// shutdown as clean.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let scheduler = self
            .scheduler
            .lock()
            .map_err(|_| SyncError::LockPoisoned)?
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        if let Err(e) = self.backups.snapshot() {
            log::warn!("Sync context: final snapshot failed: {}", e);
        }
        self.coordinator.unregister()?;
        self.backups.stop(Utc::now())?;

        log::info!("Sync context {} stopped", self.coordinator.context_id());
        Ok(())
    }
}
