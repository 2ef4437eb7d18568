use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::remote::RemoteStore;

/// Online/offline flag with the time it last changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connectivity {
    pub online: bool,
    pub changed_at: DateTime<Utc>,
}

/// Publishes connectivity transitions to any number of watchers
pub struct ConnectivityMonitor {
    sender: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(Connectivity {
            online,
            changed_at: Utc::now(),
        });
        Self { sender }
    }

    pub fn current(&self) -> Connectivity {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().online
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.set_online_at(online, Utc::now())
    }

    /// Record a transition. Returns `false` when the flag did not change.
    pub fn set_online_at(&self, online: bool, now: DateTime<Utc>) -> bool {
        let changed = self.sender.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            *state = Connectivity {
                online,
                changed_at: now,
            };
            true
        });
        if changed {
            log::info!("Connectivity: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.sender.subscribe()
    }
}

/// Treat the remote as reachable unless listing fails with a transient error
pub async fn check_reachable(remote: &dyn RemoteStore, owner_id: &str) -> bool {
    match remote.fetch_all(owner_id).await {
        Ok(_) => true,
        Err(e) if e.is_transient() => {
            log::debug!("Connectivity: remote unreachable: {}", e);
            false
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    #[tokio::test]
    async fn test_transitions_notify_watchers() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        rx.changed().await.unwrap();
        assert!(rx.borrow().online);
    }

    #[tokio::test]
    async fn test_check_reachable() {
        let remote = MemoryRemote::new();
        assert!(check_reachable(&remote, "me").await);
        remote.set_available(false);
        assert!(!check_reachable(&remote, "me").await);
    }
}
