//! Worker scheduler: polls the queue and runs claimed jobs in the background.
//!
//! One poll loop per process. Each tick claims at most one job, and only when
//! fewer than `max_concurrent_jobs` are in flight. Claimed jobs run on their
//! own tasks so a slow executor never delays the next tick. Several processes
//! may poll the same storage root; the queue's claim step keeps them from
//! running the same job twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::ConversationId;
use crate::worker::worker::{Worker, WorkerDeps};

/// Holds one concurrency slot; releasing it wakes `wait_idle` callers.
struct ActiveSlot {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ActiveSlot {
    /// Take a slot if fewer than `max` are held.
    fn try_acquire(active: &Arc<AtomicUsize>, idle: &Arc<Notify>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
                idle: Arc::clone(idle),
            })
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.idle.notify_waiters();
    }
}

/// Polls for pending jobs and dispatches them to workers.
pub struct Scheduler {
    deps: WorkerDeps,
    running: AtomicBool,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(deps: WorkerDeps) -> Arc<Self> {
        let (shutdown, _rx) = watch::channel(false);
        Arc::new(Self {
            deps,
            running: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            shutdown,
            poll_handle: Mutex::new(None),
        })
    }

    /// Recover stalled jobs, then start polling. Calling it again while
    /// running does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let config = &self.deps.config;
        match self.deps.queue.recover_stalled(config.stall_threshold).await {
            Ok(count) => info!(recovered = count, "Stalled-job recovery finished"),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        }

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let this = Arc::clone(self);
        let poll_interval = config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        this.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Poll loop exited");
        });
        *self.poll_handle.lock().await = Some(handle);

        info!(
            interval_ms = poll_interval.as_millis() as u64,
            max_concurrent = config.max_concurrent_jobs,
            worker = %self.deps.queue.worker_id(),
            "Worker scheduler started"
        );
        Ok(())
    }

    /// Stop polling. In-flight jobs keep running to completion; use
    /// [`Scheduler::wait_idle`] to wait for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let handle = self.poll_handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Poll loop ended abnormally");
        }
        info!(in_flight = self.active_jobs(), "Worker scheduler stopped");
    }

    /// One poll cycle. Returns the id of the job it dispatched, if any.
    pub async fn tick(self: &Arc<Self>) -> Option<ConversationId> {
        let max = self.deps.config.max_concurrent_jobs;
        let Some(slot) = ActiveSlot::try_acquire(&self.active, &self.idle, max) else {
            debug!(active = self.active_jobs(), max, "At capacity, skipping tick");
            return None;
        };

        let job = match self.deps.queue.dequeue().await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Queue scan failed");
                return None;
            }
        };

        let id = job.conversation_id.clone();
        let worker = Worker::new(job, self.deps.clone());
        tokio::spawn(async move {
            let _slot = slot;
            let outcome = worker.run().await;
            debug!(?outcome, "Worker finished");
        });
        Some(id)
    }

    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of jobs currently executing in this process.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no jobs are executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_jobs() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::config::WorkerConfig;
    use crate::jobs::{JobDescriptor, JobQueue, JobState};
    use crate::store::{ConversationStore, Layout, Message};
    use crate::tools::ExecutorRegistry;
    use crate::tools::builtin::EchoExecutor;

    async fn deps(config: WorkerConfig) -> (WorkerDeps, TempDir) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_dirs().await.unwrap();
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(Arc::new(EchoExecutor::new())).await;
        let deps = WorkerDeps {
            queue: JobQueue::new(layout.clone()),
            conversations: ConversationStore::new(layout),
            executors,
            config,
        };
        (deps, dir)
    }

    async fn submit(deps: &WorkerDeps, params: serde_json::Value) -> ConversationId {
        let conversation = deps
            .conversations
            .create(vec![Message::user("hi")])
            .await
            .unwrap();
        let id = conversation.id;
        deps.queue.statuses().create(&id, "echo").await.unwrap();
        deps.queue
            .enqueue(&JobDescriptor::new(id.clone(), "echo", params))
            .await
            .unwrap();
        id
    }

    async fn wait_for_state(deps: &WorkerDeps, id: &ConversationId, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(status)) = deps.queue.get_status(id).await
                    && status.state() == state
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach expected state");
    }

    #[tokio::test]
    async fn tick_dispatches_one_job() {
        let (deps, _dir) = deps(WorkerConfig::default()).await;
        let id = submit(&deps, serde_json::json!({"text": "hello"})).await;
        let scheduler = Scheduler::new(deps);

        assert_eq!(scheduler.tick().await, Some(id.clone()));
        scheduler.wait_idle().await;
        assert_eq!(scheduler.active_jobs(), 0);

        let status = scheduler.deps().queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status.state(), JobState::Completed);
        assert_eq!(scheduler.tick().await, None);
    }

    #[tokio::test]
    async fn tick_respects_concurrency_ceiling() {
        let config = WorkerConfig {
            max_concurrent_jobs: 1,
            ..WorkerConfig::default()
        };
        let (deps, _dir) = deps(config).await;
        submit(&deps, serde_json::json!({"text": "a", "delay_ms": 200})).await;
        submit(&deps, serde_json::json!({"text": "b", "delay_ms": 200})).await;
        let scheduler = Scheduler::new(deps);

        assert!(scheduler.tick().await.is_some());
        assert_eq!(scheduler.active_jobs(), 1);
        assert_eq!(scheduler.tick().await, None);

        scheduler.wait_idle().await;
        assert!(scheduler.tick().await.is_some());
        scheduler.wait_idle().await;
        assert!(scheduler.deps().queue.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (deps, _dir) = deps(WorkerConfig::default()).await;
        let scheduler = Scheduler::new(deps);

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn poll_loop_drains_queue() {
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        let (deps, _dir) = deps(config).await;
        let mut ids = Vec::new();
        for text in ["one", "two", "three", "four"] {
            ids.push(submit(&deps, serde_json::json!({ "text": text })).await);
        }
        let scheduler = Scheduler::new(deps.clone());
        scheduler.start().await.unwrap();

        for id in &ids {
            wait_for_state(&deps, id, JobState::Completed).await;
        }
        scheduler.stop().await;
        scheduler.wait_idle().await;

        for id in &ids {
            let conversation = deps.conversations.load(id).await.unwrap();
            assert_eq!(conversation.message_count(), 2);
        }
    }

    #[tokio::test]
    async fn start_recovers_jobs_abandoned_by_a_dead_worker() {
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(10),
            stall_threshold: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let (deps, _dir) = deps(config).await;
        let id = submit(&deps, serde_json::json!({"text": "again"})).await;

        // Another process claimed it and then vanished.
        let other = JobQueue::new(deps.queue.statuses().layout().clone());
        assert!(other.dequeue().await.unwrap().is_some());
        let status = deps.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status.state(), JobState::InProgress);

        let scheduler = Scheduler::new(deps.clone());
        scheduler.start().await.unwrap();
        wait_for_state(&deps, &id, JobState::Completed).await;
        scheduler.stop().await;

        let status = deps.queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(status.attempts, 0);
        assert_eq!(status.error_history.len(), 1);
        assert_eq!(status.error_history[0].code, crate::error::codes::STALLED);
    }
}
