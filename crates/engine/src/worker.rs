//! Paced drain loop for one session's queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use bulkrelay_core::{QueuedItem, SessionId, WorkerRunState};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::queue::SessionQueue;

/// Drains one session's queue, one item at a time, pacing dispatches.
///
/// Exactly one loop runs per worker: `start()` is idempotent, and a
/// restarted worker bumps an internal epoch so any stale loop exits at
/// its next check instead of racing the new one.
#[derive(Clone)]
pub struct SessionWorker {
    session: SessionId,
    queue: SessionQueue,
    dispatcher: Arc<dyn Dispatcher>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    wake: Arc<Notify>,
    created_at: DateTime<Utc>,
    /// Whether the persisted run-state said this worker was draining.
    /// Only `QueueRegistry::restore_workers` acts on it.
    was_active: bool,
}

impl SessionWorker {
    pub fn new(
        session: SessionId,
        queue: SessionQueue,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            session,
            queue,
            dispatcher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
            wake: Arc::new(Notify::new()),
            created_at: Utc::now(),
            was_active: false,
        }
    }

    /// Rebuild a worker from its persisted run-state, bound to `queue`.
    ///
    /// The worker is NOT started; resuming is an explicit, separate step.
    pub fn from_state(
        state: &WorkerRunState,
        queue: SessionQueue,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        let mut worker = Self::new(state.session.clone(), queue, dispatcher, config);
        worker.created_at = state.created_at;
        worker.was_active = state.is_active;
        worker
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the persisted snapshot recorded this worker as draining.
    pub fn was_active(&self) -> bool {
        self.was_active
    }

    /// The persisted form of this worker's run-state.
    pub fn run_state(&self) -> WorkerRunState {
        WorkerRunState::new(self.session.clone(), self.is_active(), self.created_at)
    }

    /// Start the drain loop. No-op if already running.
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(session = %self.session, "worker already running");
            return;
        }

        let my_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run(my_epoch).await;
        });
    }

    /// Stop the drain loop.
    ///
    /// Observed at the next loop check: immediately if the loop is
    /// waiting (the wait is cancelled), or after the in-flight dispatch
    /// completes. An in-flight dispatch is never interrupted.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        info!(session = %self.session, "worker stopped");
    }

    fn should_run(&self, my_epoch: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == my_epoch
    }

    async fn run(&self, my_epoch: u64) {
        info!(session = %self.session, "worker started");

        while self.should_run(my_epoch) {
            let Some(item) = self.queue.next_pending() else {
                self.wait(self.config.idle_poll_interval).await;
                continue;
            };

            self.execute(item).await;

            // Deliberate rate limiting between consecutive dispatches.
            self.wait(self.config.pacing_interval).await;
        }

        debug!(session = %self.session, "worker loop exited");
    }

    /// Sleep for `duration` or until woken by `stop()`, whichever first.
    async fn wait(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn execute(&self, item: QueuedItem) {
        let id = item.id;
        self.queue.mark_executing(id);

        debug!(
            session = %self.session,
            item = %id,
            url = %item.job.url,
            "dispatching item"
        );

        match self
            .dispatcher
            .dispatch(&item.job, self.config.dispatch_timeout)
            .await
        {
            Ok(result) => {
                self.queue.mark_completed(id, Some(result));
                info!(session = %self.session, item = %id, "item completed");
            }
            Err(e) => {
                let message = e.item_message();
                self.queue.mark_failed(id, message.clone());
                warn!(session = %self.session, item = %id, error = %message, "item failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchError;
    use async_trait::async_trait;
    use bulkrelay_core::{CampaignId, DispatchJob, ItemStatus};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records dispatched URLs; fails any URL containing `fail_marker`.
    struct RecordingDispatcher {
        calls: Mutex<Vec<String>>,
        fail_marker: Option<String>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_marker: None,
            })
        }

        fn failing_on(marker: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_marker: Some(marker.to_string()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            job: &DispatchJob,
            _timeout: Duration,
        ) -> Result<serde_json::Value, DispatchError> {
            self.calls.lock().unwrap().push(job.url.clone());
            match &self.fail_marker {
                Some(marker) if job.url.contains(marker) => Err(DispatchError::Rejected {
                    status: 422,
                    message: "number blocked".to_string(),
                }),
                _ => Ok(json!({"sent": true})),
            }
        }
    }

    fn jobs(urls: &[&str]) -> Vec<DispatchJob> {
        urls.iter()
            .map(|u| DispatchJob::new("POST", *u, json!({})))
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn drains_queue_in_fifo_order() {
        let queue = SessionQueue::new();
        queue.add_items(jobs(&["http://g/a", "http://g/b", "http://g/c"]), &CampaignId::from("c1"));

        let dispatcher = RecordingDispatcher::new();
        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            EngineConfig::immediate(),
        );
        worker.start();

        wait_until(|| queue.pending_count() == 0).await;

        assert_eq!(dispatcher.calls(), vec!["http://g/a", "http://g/b", "http://g/c"]);
        assert!(queue
            .snapshot()
            .iter()
            .all(|item| item.status == ItemStatus::Completed));
        assert!(worker.is_active());

        worker.stop();
    }

    #[tokio::test]
    async fn failure_is_recorded_and_loop_continues() {
        let queue = SessionQueue::new();
        let items = queue.add_items(
            jobs(&["http://g/a", "http://g/b-fail", "http://g/c"]),
            &CampaignId::from("c1"),
        );

        let dispatcher = RecordingDispatcher::failing_on("fail");
        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            EngineConfig::immediate(),
        );
        worker.start();

        wait_until(|| queue.pending_count() == 0).await;

        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].status, ItemStatus::Completed);
        assert_eq!(snapshot[1].status, ItemStatus::Failed);
        assert_eq!(snapshot[1].error.as_deref(), Some("number blocked"));
        assert_eq!(snapshot[2].status, ItemStatus::Completed);
        assert_eq!(snapshot[2].id, items[2].id);

        // The loop survived the failure.
        assert!(worker.is_active());
        worker.stop();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let queue = SessionQueue::new();
        queue.add_items(jobs(&["http://g/a", "http://g/b"]), &CampaignId::from("c1"));

        let dispatcher = RecordingDispatcher::new();
        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            EngineConfig::immediate(),
        );
        worker.start();
        worker.start();
        worker.start();

        wait_until(|| queue.pending_count() == 0).await;
        // A second loop would have dispatched items twice.
        assert_eq!(dispatcher.calls().len(), 2);

        worker.stop();
    }

    #[tokio::test]
    async fn stop_during_idle_wait_is_prompt() {
        let queue = SessionQueue::new();
        let dispatcher = RecordingDispatcher::new();
        let mut config = EngineConfig::immediate();
        config.idle_poll_interval = Duration::from_secs(3600);

        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            config,
        );
        worker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.stop();
        assert!(!worker.is_active());

        // Work enqueued after stop is left alone.
        queue.add_items(jobs(&["http://g/a"]), &CampaignId::from("c1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dispatcher.calls().is_empty());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn stopped_worker_resumes_where_it_left_off() {
        let queue = SessionQueue::new();
        queue.add_items(jobs(&["http://g/a", "http://g/b"]), &CampaignId::from("c1"));

        let dispatcher = RecordingDispatcher::new();
        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            EngineConfig::immediate(),
        );

        worker.start();
        wait_until(|| queue.pending_count() == 0).await;
        worker.stop();

        queue.add_items(jobs(&["http://g/c"]), &CampaignId::from("c1"));
        worker.start();
        wait_until(|| queue.pending_count() == 0).await;

        assert_eq!(dispatcher.calls(), vec!["http://g/a", "http://g/b", "http://g/c"]);
        worker.stop();
    }

    #[tokio::test]
    async fn run_state_round_trip_does_not_start_worker() {
        let queue = SessionQueue::new();
        let dispatcher = RecordingDispatcher::new();
        let worker = SessionWorker::new(
            SessionId::from("s1"),
            queue.clone(),
            dispatcher.clone(),
            EngineConfig::immediate(),
        );
        worker.start();

        let state = worker.run_state();
        assert!(state.is_active);
        worker.stop();

        let restored = SessionWorker::from_state(
            &state,
            queue,
            dispatcher,
            EngineConfig::immediate(),
        );
        assert_eq!(restored.session(), &SessionId::from("s1"));
        assert_eq!(restored.run_state().created_at, state.created_at);
        assert!(restored.was_active());
        // Deserialization alone never starts the loop.
        assert!(!restored.is_active());
    }
}
