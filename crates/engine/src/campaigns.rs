//! Persisted catalog of campaign metadata.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use bulkrelay_core::{CampaignId, CampaignRecord, CampaignStatus};
use bulkrelay_persistence::{PersistenceStore, StoreError};

use crate::config::EngineConfig;

/// Store key for the campaign catalog document.
const CAMPAIGNS_KEY: &str = "campaigns";

/// Per-status totals across the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CampaignSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

struct ManagerInner {
    campaigns: Mutex<BTreeMap<CampaignId, CampaignRecord>>,
    store: PersistenceStore,
    config: EngineConfig,
}

/// Catalog of registered campaigns, snapshotted to the store on mutation.
///
/// Cheap to clone. Item-level progress lives on the queues; this tracks
/// only the campaign records themselves.
#[derive(Clone)]
pub struct CampaignManager {
    inner: Arc<ManagerInner>,
}

impl CampaignManager {
    pub fn new(store: PersistenceStore, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                campaigns: Mutex::new(BTreeMap::new()),
                store,
                config,
            }),
        }
    }

    /// Register a campaign, replacing any record with the same id.
    pub fn register(&self, record: CampaignRecord) {
        let id = record.campaign_id.clone();
        self.inner
            .campaigns
            .lock()
            .unwrap()
            .insert(id.clone(), record);
        info!(campaign = %id, "registered campaign");
        self.schedule_save();
    }

    pub fn get(&self, id: &CampaignId) -> Option<CampaignRecord> {
        self.inner.campaigns.lock().unwrap().get(id).cloned()
    }

    /// Every record, ordered by campaign id.
    pub fn all(&self) -> Vec<CampaignRecord> {
        self.inner.campaigns.lock().unwrap().values().cloned().collect()
    }

    /// Update a campaign's status. Returns false when the id is unknown.
    pub fn update_status(&self, id: &CampaignId, status: CampaignStatus) -> bool {
        let updated = {
            let mut campaigns = self.inner.campaigns.lock().unwrap();
            match campaigns.get_mut(id) {
                Some(record) => {
                    record.status = status;
                    true
                }
                None => false,
            }
        };
        if updated {
            debug!(campaign = %id, ?status, "updated campaign status");
            self.schedule_save();
        }
        updated
    }

    /// Remove a campaign's record. Returns the removed record, if any.
    ///
    /// Queued items of the campaign are untouched; clearing those is the
    /// registry's job.
    pub fn remove(&self, id: &CampaignId) -> Option<CampaignRecord> {
        let removed = self.inner.campaigns.lock().unwrap().remove(id);
        if removed.is_some() {
            info!(campaign = %id, "removed campaign");
            self.schedule_save();
        }
        removed
    }

    pub fn summary(&self) -> CampaignSummary {
        let campaigns = self.inner.campaigns.lock().unwrap();
        let mut summary = CampaignSummary {
            total: campaigns.len(),
            ..CampaignSummary::default()
        };
        for record in campaigns.values() {
            match record.status {
                CampaignStatus::Pending => summary.pending += 1,
                CampaignStatus::InProgress => summary.in_progress += 1,
                CampaignStatus::Completed => summary.completed += 1,
                CampaignStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Write the catalog to the store immediately.
    pub async fn save(&self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        self.inner.store.save(CAMPAIGNS_KEY, &snapshot).await?;
        self.inner
            .store
            .cleanup_old_backups(CAMPAIGNS_KEY, self.inner.config.backup_keep)
            .await;
        Ok(())
    }

    /// Replace the in-memory catalog with the persisted one.
    ///
    /// Returns the number of records loaded.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let Some(persisted) = self
            .inner
            .store
            .load::<BTreeMap<CampaignId, CampaignRecord>>(CAMPAIGNS_KEY)
            .await?
        else {
            debug!("no persisted campaigns found");
            return Ok(0);
        };

        let count = persisted.len();
        *self.inner.campaigns.lock().unwrap() = persisted;
        info!(campaigns = count, "restored campaign catalog from disk");
        Ok(count)
    }

    fn snapshot(&self) -> BTreeMap<CampaignId, CampaignRecord> {
        self.inner.campaigns.lock().unwrap().clone()
    }

    fn schedule_save(&self) {
        let manager = self.clone();
        self.inner.store.debounced_save(
            CAMPAIGNS_KEY,
            move || manager.snapshot(),
            self.inner.config.save_debounce,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> CampaignManager {
        let store = PersistenceStore::open(dir).unwrap();
        CampaignManager::new(store, EngineConfig::immediate())
    }

    #[tokio::test]
    async fn register_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let record = CampaignRecord::new(CampaignId::from("c1"), 3, 40);
        manager.register(record.clone());

        assert_eq!(manager.get(&CampaignId::from("c1")), Some(record.clone()));
        assert_eq!(manager.remove(&CampaignId::from("c1")), Some(record));
        assert_eq!(manager.get(&CampaignId::from("c1")), None);
        assert_eq!(manager.remove(&CampaignId::from("c1")), None);
    }

    #[tokio::test]
    async fn update_status_only_touches_known_campaigns() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.register(CampaignRecord::new(CampaignId::from("c1"), 1, 10));

        assert!(manager.update_status(&CampaignId::from("c1"), CampaignStatus::InProgress));
        assert!(!manager.update_status(&CampaignId::from("ghost"), CampaignStatus::Failed));

        let record = manager.get(&CampaignId::from("c1")).unwrap();
        assert_eq!(record.status, CampaignStatus::InProgress);
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager.register(CampaignRecord::new(CampaignId::from("a"), 1, 1));
        manager.register(CampaignRecord::new(CampaignId::from("b"), 1, 1));
        manager.register(CampaignRecord::new(CampaignId::from("c"), 1, 1));
        manager.update_status(&CampaignId::from("b"), CampaignStatus::InProgress);
        manager.update_status(&CampaignId::from("c"), CampaignStatus::Completed);

        let summary = manager.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn catalog_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let first = manager(dir.path());
        first.register(CampaignRecord::new(CampaignId::from("c1"), 2, 30));
        first.update_status(&CampaignId::from("c1"), CampaignStatus::Completed);
        first.save().await.unwrap();

        let second = manager(dir.path());
        assert_eq!(second.load().await.unwrap(), 1);

        let record = second.get(&CampaignId::from("c1")).unwrap();
        assert_eq!(record.status, CampaignStatus::Completed);
        assert_eq!(record.total_contacts, 30);
    }

    #[tokio::test]
    async fn mutations_write_through_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager.register(CampaignRecord::new(CampaignId::from("c1"), 1, 5));
        manager.register(CampaignRecord::new(CampaignId::from("c2"), 1, 5));

        let path = dir.path().join("campaigns.json");
        for _ in 0..500 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let persisted: BTreeMap<CampaignId, CampaignRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
    }
}
