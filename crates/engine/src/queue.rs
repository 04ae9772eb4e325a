//! Per-session FIFO queue of dispatch jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use bulkrelay_core::{CampaignId, DispatchJob, ItemId, ItemStatus, QueuedItem};

#[derive(Default)]
struct QueueInner {
    /// Items in enqueue order. Order is the dispatch order.
    items: Vec<QueuedItem>,
    /// Item id -> position in `items`, for O(1) status updates.
    index: HashMap<ItemId, usize>,
}

impl QueueInner {
    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id, pos))
            .collect();
    }
}

/// Insertion-ordered queue of dispatch items for one session.
///
/// Cheap to clone; the registry and the session's worker share the same
/// underlying state.
#[derive(Clone, Default)]
pub struct SessionQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted items, preserving their order.
    pub fn from_items(items: Vec<QueuedItem>) -> Self {
        let queue = Self::new();
        {
            let mut inner = queue.inner.lock().unwrap();
            inner.items = items;
            inner.reindex();
        }
        queue
    }

    /// Append jobs as pending items at the tail.
    ///
    /// Returns the created items in insertion order.
    pub fn add_items(&self, jobs: Vec<DispatchJob>, campaign_id: &CampaignId) -> Vec<QueuedItem> {
        let mut inner = self.inner.lock().unwrap();
        let mut created = Vec::with_capacity(jobs.len());

        for job in jobs {
            let item = QueuedItem::new(job, campaign_id.clone());
            let pos = inner.items.len();
            inner.index.insert(item.id, pos);
            inner.items.push(item.clone());
            created.push(item);
        }

        debug!(count = created.len(), campaign = %campaign_id, "added items to queue");
        created
    }

    /// The earliest-inserted item still pending, if any. Does not mutate.
    pub fn next_pending(&self) -> Option<QueuedItem> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .iter()
            .find(|item| item.status == ItemStatus::Pending)
            .cloned()
    }

    /// Mark an item executing. No-op when the id is absent.
    pub fn mark_executing(&self, id: ItemId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&pos) = inner.index.get(&id) {
            inner.items[pos].mark_executing();
        }
    }

    /// Mark an item completed with the gateway's response. No-op when the
    /// id is absent (the item may have been cleared mid-dispatch).
    pub fn mark_completed(&self, id: ItemId, result: Option<serde_json::Value>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&pos) = inner.index.get(&id) {
            inner.items[pos].mark_completed(result);
        }
    }

    /// Mark an item failed with an error message. No-op when the id is
    /// absent.
    pub fn mark_failed(&self, id: ItemId, error: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&pos) = inner.index.get(&id) {
            inner.items[pos].mark_failed(error);
        }
    }

    /// Remove every item of `campaign_id`, any status, preserving the
    /// relative order of the remainder.
    pub fn clear_campaign(&self, campaign_id: &CampaignId) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.items.len();
        inner.items.retain(|item| &item.campaign_id != campaign_id);
        inner.reindex();
        debug!(
            campaign = %campaign_id,
            removed = before - inner.items.len(),
            "cleared campaign from queue"
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .count()
    }

    /// All items for one campaign, in queue order.
    pub fn items_for_campaign(&self, campaign_id: &CampaignId) -> Vec<QueuedItem> {
        self.inner
            .lock()
            .unwrap()
            .items
            .iter()
            .filter(|item| &item.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// Clone of all items in order; this is also the persisted form.
    pub fn snapshot(&self) -> Vec<QueuedItem> {
        self.inner.lock().unwrap().items.clone()
    }
}
