use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::storage::BackupManager;

use super::config::SyncConfig;
use super::connectivity::Connectivity;
use super::coordinator::{BroadcastMessage, Coordinator};
use super::manager::SyncOrchestrator;

/// How often storage usage is checked outside of snapshot writes
const QUOTA_CHECK_SECS: u64 = 60;

/// Floor for the queue retry tick
const MIN_DRAIN_TICK_MS: u64 = 250;

/// Messages to control the sync scheduler
#[derive(Debug)]
pub enum SyncSchedulerMessage {
    /// Drain and reconcile right away
    SyncNow,
    /// Context closing
    Shutdown,
}

/// Handle for the background sync loop
pub struct SyncScheduler {
    sender: mpsc::Sender<SyncSchedulerMessage>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn sync_now(&self) {
        let _ = self.sender.try_send(SyncSchedulerMessage::SyncNow);
    }

    /// Ask the loop to stop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.sender.send(SyncSchedulerMessage::Shutdown).await;
        if let Err(e) = self.handle.await {
            log::error!("Sync scheduler: task ended abnormally: {}", e);
        }
    }
}

/// Everything the loop drives
pub struct SchedulerServices {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub coordinator: Arc<Coordinator>,
    pub backups: Arc<BackupManager>,
    pub connectivity: watch::Receiver<Connectivity>,
}

/// Spawn the timer and event loop for one context. Must be called inside a
/// tokio runtime.
pub fn start_sync_scheduler(services: SchedulerServices, config: &SyncConfig) -> SyncScheduler {
    let (tx, rx) = mpsc::channel(32);
    let broadcasts = services.coordinator.subscribe();
    let timers = Timers::new(config);

    let handle = tokio::spawn(async move {
        sync_scheduler_loop(services, timers, broadcasts, rx).await;
    });

    SyncScheduler { sender: tx, handle }
}

struct Timers {
    backup: Interval,
    crash_heartbeat: Interval,
    tab_heartbeat: Interval,
    reconcile: Interval,
    drain: Interval,
    quota: Interval,
}

impl Timers {
    fn new(config: &SyncConfig) -> Self {
        let drain_ms = config.queue.base_delay_ms.max(MIN_DRAIN_TICK_MS);
        Self {
            backup: ticker(Duration::from_secs(config.backup.interval_secs)),
            crash_heartbeat: ticker(Duration::from_secs(config.backup.heartbeat_interval_secs)),
            tab_heartbeat: ticker(Duration::from_secs(config.tabs.heartbeat_interval_secs)),
            reconcile: ticker(config.reconcile_interval()),
            drain: ticker(Duration::from_millis(drain_ms)),
            quota: ticker(Duration::from_secs(QUOTA_CHECK_SECS)),
        }
    }
}

/// Interval whose first tick is one period away
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sync_scheduler_loop(
    services: SchedulerServices,
    mut timers: Timers,
    mut broadcasts: BoxStream<'static, BroadcastMessage>,
    mut receiver: mpsc::Receiver<SyncSchedulerMessage>,
) {
    let SchedulerServices {
        orchestrator,
        coordinator,
        backups,
        mut connectivity,
    } = services;

    log::info!("Sync scheduler started for context {}", coordinator.context_id());

    let mut connectivity_open = true;
    let mut broadcasts_open = true;

    loop {
        tokio::select! {
            _ = timers.backup.tick() => {
                if let Err(e) = backups.snapshot() {
                    log::warn!("Sync scheduler: periodic snapshot failed: {}", e);
                }
            }

            _ = timers.crash_heartbeat.tick() => {
                if let Err(e) = backups.beat(Utc::now()) {
                    log::warn!("Sync scheduler: crash heartbeat failed: {}", e);
                }
            }

            _ = timers.tab_heartbeat.tick() => {
                if let Err(e) = coordinator.heartbeat(Utc::now()) {
                    log::warn!("Sync scheduler: tab heartbeat failed: {}", e);
                }
            }

            _ = timers.quota.tick() => {
                if let Err(e) = backups.check_quota() {
                    log::warn!("Sync scheduler: quota check failed: {}", e);
                }
            }

            _ = timers.drain.tick() => {
                if !orchestrator.is_online() {
                    continue;
                }
                match orchestrator.pending_operations() {
                    Ok(0) => {}
                    Ok(_) => {
                        if let Err(e) = orchestrator.sync_pending().await {
                            log::warn!("Sync scheduler: queue drain failed: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Sync scheduler: cannot read queue: {}", e),
                }
            }

            _ = timers.reconcile.tick() => {
                if !orchestrator.is_online() {
                    continue;
                }
                if let Err(e) = orchestrator.reconcile().await {
                    log::warn!("Sync scheduler: periodic reconciliation failed: {}", e);
                }
            }

            changed = connectivity.changed(), if connectivity_open => {
                if changed.is_err() {
                    log::debug!("Sync scheduler: connectivity source closed");
                    connectivity_open = false;
                    continue;
                }
                let state = *connectivity.borrow_and_update();
                if state.online {
                    match orchestrator.handle_online(state.changed_at).await {
                        Ok(result) => log::info!(
                            "Sync scheduler: reconnect sync complete, pulled={}, pushed={}",
                            result.notes_pulled,
                            result.notes_pushed,
                        ),
                        Err(e) => log::warn!("Sync scheduler: reconnect sync failed: {}", e),
                    }
                } else if let Err(e) = orchestrator.handle_offline(state.changed_at) {
                    log::warn!("Sync scheduler: offline handling failed: {}", e);
                }
            }

            message = broadcasts.next(), if broadcasts_open => {
                let Some(message) = message else {
                    log::debug!("Sync scheduler: broadcast channel closed");
                    broadcasts_open = false;
                    continue;
                };
                if let Err(e) = orchestrator.handle_broadcast(&message) {
                    log::warn!("Sync scheduler: broadcast for note {} failed: {}", message.note_id, e);
                }
            }

            msg = receiver.recv() => {
                match msg {
                    Some(SyncSchedulerMessage::SyncNow) => {
                        log::info!("Sync scheduler: sync requested");
                        if let Err(e) = orchestrator.sync_now().await {
                            log::warn!("Sync scheduler: requested sync failed: {}", e);
                        }
                    }
                    Some(SyncSchedulerMessage::Shutdown) | None => {
                        log::info!("Sync scheduler: shutting down");
                        break;
                    }
                }
            }
        }
    }
}
