//! Session -> (queue, worker) registry with durable snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use bulkrelay_core::{CampaignId, DispatchJob, ItemId, ItemStatus, QueuedItem, SessionId, WorkerRunState};
use bulkrelay_persistence::{PersistenceStore, StoreError};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::queue::SessionQueue;
use crate::worker::SessionWorker;

/// Store key for the combined queues + worker run-states document.
const QUEUES_KEY: &str = "queues";

/// The persisted form of the whole registry.
///
/// Sorted maps keep the on-disk JSON stable across saves, so backups diff
/// cleanly.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedQueues {
    pub queues: BTreeMap<SessionId, Vec<QueuedItem>>,
    pub workers: BTreeMap<SessionId, WorkerRunState>,
}

/// The outcome of one item, as reported in campaign progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub id: ItemId,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-campaign progress within one session's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignProgress {
    pub campaign_id: CampaignId,
    pub total: usize,
    pub pending: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    /// One entry per item, in queue order.
    pub outcomes: Vec<ItemOutcome>,
}

/// Point-in-time status of one session's queue and worker.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: SessionId,
    pub worker_active: bool,
    pub total_items: usize,
    pub pending: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Campaigns in first-seen queue order.
    pub campaigns: Vec<CampaignProgress>,
}

/// Aggregate counters across every session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_items: usize,
    pub total_pending: usize,
}

/// Raw dump of one session's state, for inspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDump {
    pub worker: WorkerRunState,
    pub items: Vec<QueuedItem>,
}

struct SessionEntry {
    queue: SessionQueue,
    worker: SessionWorker,
}

struct RegistryInner {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    store: PersistenceStore,
    dispatcher: Arc<dyn Dispatcher>,
    config: EngineConfig,
}

/// Owns every session's queue and worker, and snapshots them to the store.
///
/// Cheap to clone; clones share the same sessions. Mutations schedule a
/// debounced snapshot, so bursts of enqueues collapse into one write.
#[derive(Clone)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

impl QueueRegistry {
    pub fn new(store: PersistenceStore, dispatcher: Arc<dyn Dispatcher>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                store,
                dispatcher,
                config,
            }),
        }
    }

    /// Queue `jobs` on `session` and ensure its worker is draining.
    ///
    /// Creates the session's queue and worker on first use. Returns the
    /// created items in dispatch order.
    pub fn enqueue(
        &self,
        session: &SessionId,
        jobs: Vec<DispatchJob>,
        campaign_id: &CampaignId,
    ) -> Vec<QueuedItem> {
        let (items, worker) = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions
                .entry(session.clone())
                .or_insert_with(|| self.new_entry(session));
            (entry.queue.add_items(jobs, campaign_id), entry.worker.clone())
        };

        info!(session = %session, count = items.len(), campaign = %campaign_id, "enqueued items");
        self.schedule_save();
        worker.start();
        items
    }

    /// Start the worker for `session`. Returns false for unknown sessions.
    pub fn start_worker(&self, session: &SessionId) -> bool {
        let sessions = self.inner.sessions.lock().unwrap();
        match sessions.get(session) {
            Some(entry) => {
                entry.worker.start();
                drop(sessions);
                self.schedule_save();
                true
            }
            None => false,
        }
    }

    /// Stop the worker for `session`. Returns false for unknown sessions.
    ///
    /// The queue keeps its items; a later start resumes where it left off.
    pub fn stop_worker(&self, session: &SessionId) -> bool {
        let sessions = self.inner.sessions.lock().unwrap();
        match sessions.get(session) {
            Some(entry) => {
                entry.worker.stop();
                drop(sessions);
                self.schedule_save();
                true
            }
            None => false,
        }
    }

    /// Remove every item of `campaign_id` from every session's queue.
    pub fn clear_campaign(&self, campaign_id: &CampaignId) {
        {
            let sessions = self.inner.sessions.lock().unwrap();
            for entry in sessions.values() {
                entry.queue.clear_campaign(campaign_id);
            }
        }
        info!(campaign = %campaign_id, "cleared campaign from all queues");
        self.schedule_save();
    }

    /// Status of one session, or `None` when the session is unknown.
    pub fn status_for(&self, session: &SessionId) -> Option<SessionStatus> {
        let (items, active) = {
            let sessions = self.inner.sessions.lock().unwrap();
            let entry = sessions.get(session)?;
            (entry.queue.snapshot(), entry.worker.is_active())
        };
        Some(build_status(session.clone(), active, items))
    }

    /// Status of every known session, keyed by session id.
    pub fn all_statuses(&self) -> BTreeMap<SessionId, SessionStatus> {
        let snapshots: Vec<(SessionId, bool, Vec<QueuedItem>)> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .iter()
                .map(|(id, entry)| (id.clone(), entry.worker.is_active(), entry.queue.snapshot()))
                .collect()
        };

        snapshots
            .into_iter()
            .map(|(id, active, items)| (id.clone(), build_status(id, active, items)))
            .collect()
    }

    /// Aggregate counters across every session.
    pub fn stats(&self) -> RegistryStats {
        let sessions = self.inner.sessions.lock().unwrap();
        let mut stats = RegistryStats {
            total_sessions: sessions.len(),
            ..RegistryStats::default()
        };
        for entry in sessions.values() {
            if entry.worker.is_active() {
                stats.active_sessions += 1;
            }
            stats.total_items += entry.queue.len();
            stats.total_pending += entry.queue.pending_count();
        }
        stats
    }

    /// Raw per-session dump of queues and worker run-states.
    pub fn dump_queues(&self) -> BTreeMap<SessionId, QueueDump> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    QueueDump {
                        worker: entry.worker.run_state(),
                        items: entry.queue.snapshot(),
                    },
                )
            })
            .collect()
    }

    fn snapshot(&self) -> PersistedQueues {
        let sessions = self.inner.sessions.lock().unwrap();
        let mut persisted = PersistedQueues::default();
        for (id, entry) in sessions.iter() {
            persisted.queues.insert(id.clone(), entry.queue.snapshot());
            persisted.workers.insert(id.clone(), entry.worker.run_state());
        }
        persisted
    }

    /// Write the current snapshot to the store immediately.
    pub async fn save_all(&self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        self.inner.store.save(QUEUES_KEY, &snapshot).await?;
        self.inner
            .store
            .cleanup_old_backups(QUEUES_KEY, self.inner.config.backup_keep)
            .await;
        Ok(())
    }

    /// Rebuild sessions from the persisted snapshot.
    ///
    /// Workers are reconstructed but NOT started; see [`restore_workers`].
    /// Returns the number of sessions restored.
    ///
    /// [`restore_workers`]: QueueRegistry::restore_workers
    pub async fn load_all(&self) -> Result<usize, StoreError> {
        let Some(persisted) = self.inner.store.load::<PersistedQueues>(QUEUES_KEY).await? else {
            debug!("no persisted queues found");
            return Ok(0);
        };

        let mut sessions = self.inner.sessions.lock().unwrap();
        sessions.clear();

        let PersistedQueues { queues, mut workers } = persisted;
        let mut restored = 0;
        for (session, items) in queues {
            let queue = SessionQueue::from_items(items);
            let worker = match workers.remove(&session) {
                Some(state) => SessionWorker::from_state(
                    &state,
                    queue.clone(),
                    Arc::clone(&self.inner.dispatcher),
                    self.inner.config.clone(),
                ),
                // A queue without a recorded run-state gets a fresh,
                // stopped worker.
                None => SessionWorker::new(
                    session.clone(),
                    queue.clone(),
                    Arc::clone(&self.inner.dispatcher),
                    self.inner.config.clone(),
                ),
            };
            sessions.insert(session, SessionEntry { queue, worker });
            restored += 1;
        }

        // Run-states without a matching queue are stale; drop them.
        for session in workers.keys() {
            warn!(session = %session, "dropping worker run-state with no queue");
        }

        info!(sessions = restored, "restored queues from disk");
        Ok(restored)
    }

    /// Start the workers that were draining when the snapshot was taken.
    ///
    /// Returns the number of workers started.
    pub fn restore_workers(&self) -> usize {
        let workers: Vec<SessionWorker> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|entry| entry.worker.was_active())
                .map(|entry| entry.worker.clone())
                .collect()
        };

        let started = workers.len();
        for worker in workers {
            worker.start();
        }
        if started > 0 {
            info!(workers = started, "resumed previously-active workers");
        }
        started
    }

    /// Stop every worker, cancel pending debounced saves, and write one
    /// final snapshot.
    ///
    /// Cancelled timers would otherwise race the final write; their data
    /// is covered by the explicit save here.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        {
            let sessions = self.inner.sessions.lock().unwrap();
            for entry in sessions.values() {
                entry.worker.stop();
            }
        }
        self.inner.store.flush_all();
        self.save_all().await
    }

    fn new_entry(&self, session: &SessionId) -> SessionEntry {
        let queue = SessionQueue::new();
        let worker = SessionWorker::new(
            session.clone(),
            queue.clone(),
            Arc::clone(&self.inner.dispatcher),
            self.inner.config.clone(),
        );
        SessionEntry { queue, worker }
    }

    /// Schedule a debounced snapshot write.
    ///
    /// The supplier snapshots when the timer fires, so the write reflects
    /// the latest state rather than the state at scheduling time.
    fn schedule_save(&self) {
        let registry = self.clone();
        self.inner.store.debounced_save(
            QUEUES_KEY,
            move || registry.snapshot(),
            self.inner.config.save_debounce,
        );
    }
}

fn build_status(session: SessionId, worker_active: bool, items: Vec<QueuedItem>) -> SessionStatus {
    let mut status = SessionStatus {
        session,
        worker_active,
        total_items: items.len(),
        pending: 0,
        executing: 0,
        completed: 0,
        failed: 0,
        campaigns: Vec::new(),
    };

    let mut positions: HashMap<CampaignId, usize> = HashMap::new();
    for item in items {
        match item.status {
            ItemStatus::Pending => status.pending += 1,
            ItemStatus::Executing => status.executing += 1,
            ItemStatus::Completed => status.completed += 1,
            ItemStatus::Failed => status.failed += 1,
        }

        let pos = *positions.entry(item.campaign_id.clone()).or_insert_with(|| {
            status.campaigns.push(CampaignProgress {
                campaign_id: item.campaign_id.clone(),
                total: 0,
                pending: 0,
                executing: 0,
                completed: 0,
                failed: 0,
                outcomes: Vec::new(),
            });
            status.campaigns.len() - 1
        });

        let progress = &mut status.campaigns[pos];
        progress.total += 1;
        match item.status {
            ItemStatus::Pending => progress.pending += 1,
            ItemStatus::Executing => progress.executing += 1,
            ItemStatus::Completed => progress.completed += 1,
            ItemStatus::Failed => progress.failed += 1,
        }
        progress.outcomes.push(ItemOutcome {
            id: item.id,
            status: item.status,
            error: item.error,
        });
    }

    status
}
