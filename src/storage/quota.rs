use super::keys;
use super::local::{LocalStore, Result, StorageUsage};

/// Where current usage sits relative to the configured ratios
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaStatus {
    Ok(f64),
    Warning(f64),
    Critical(f64),
}

impl QuotaStatus {
    pub fn assess(usage: &StorageUsage, warning_ratio: f64, critical_ratio: f64) -> Self {
        let ratio = usage.ratio();
        if ratio > critical_ratio {
            QuotaStatus::Critical(ratio)
        } else if ratio > warning_ratio {
            QuotaStatus::Warning(ratio)
        } else {
            QuotaStatus::Ok(ratio)
        }
    }

    pub fn ratio(&self) -> f64 {
        match *self {
            QuotaStatus::Ok(r) | QuotaStatus::Warning(r) | QuotaStatus::Critical(r) => r,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub backups_removed: usize,
    pub ephemeral_removed: usize,
}

/// Backup snapshot ids currently stored, oldest first
pub fn backup_ids(store: &dyn LocalStore) -> Result<Vec<String>> {
    let mut ids: Vec<(i64, String)> = store
        .keys()?
        .iter()
        .filter_map(|k| keys::backup_id(k))
        .filter_map(|id| id.parse::<i64>().ok().map(|n| (n, id.to_string())))
        .collect();
    ids.sort_by_key(|(n, _)| *n);
    Ok(ids.into_iter().map(|(_, id)| id).collect())
}

/// Delete every backup except the newest, and every ephemeral key.
pub fn emergency_prune(store: &dyn LocalStore) -> Result<PruneReport> {
    let mut report = PruneReport::default();

    let ids = backup_ids(store)?;
    if ids.len() > 1 {
        for id in &ids[..ids.len() - 1] {
            store.remove(&keys::backup(id))?;
            report.backups_removed += 1;
        }
    }

    for key in store.keys()? {
        if keys::is_ephemeral(&key) {
            store.remove(&key)?;
            report.ephemeral_removed += 1;
        }
    }

    log::warn!(
        "Quota: emergency prune removed {} backups and {} ephemeral keys",
        report.backups_removed,
        report.ephemeral_removed,
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_assess_thresholds() {
        let usage = |used| StorageUsage { used, quota: 100 };
        assert_eq!(QuotaStatus::assess(&usage(50), 0.8, 0.95), QuotaStatus::Ok(0.5));
        assert_eq!(QuotaStatus::assess(&usage(80), 0.8, 0.95), QuotaStatus::Ok(0.8));
        assert_eq!(QuotaStatus::assess(&usage(81), 0.8, 0.95), QuotaStatus::Warning(0.81));
        assert_eq!(QuotaStatus::assess(&usage(96), 0.8, 0.95), QuotaStatus::Critical(0.96));
    }

    #[test]
    fn test_backup_ids_sorted_numerically() {
        let store = MemoryStore::new();
        store.set(&keys::backup("900"), json!({})).unwrap();
        store.set(&keys::backup("1000"), json!({})).unwrap();
        store.set(&keys::backup("not-a-number"), json!({})).unwrap();

        assert_eq!(backup_ids(&store).unwrap(), vec!["900".to_string(), "1000".to_string()]);
    }

    #[test]
    fn test_emergency_prune_keeps_newest_and_user_data() {
        let store = MemoryStore::new();
        for id in ["1", "2", "3"] {
            store.set(&keys::backup(id), json!({})).unwrap();
        }
        store.set(keys::NOTES, json!([])).unwrap();
        store.set("cache.search", json!({})).unwrap();
        store.set("draft.7", json!("wip")).unwrap();

        let report = emergency_prune(&store).unwrap();
        assert_eq!(report.backups_removed, 2);
        assert_eq!(report.ephemeral_removed, 2);

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec![keys::backup("3"), keys::NOTES.to_string()]);
    }
}
