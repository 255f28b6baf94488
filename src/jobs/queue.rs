//! JobQueue: priority dequeue and claiming over the shared storage root.
//!
//! A job is queued while `job.json` exists next to its `status.json`.
//! Dequeue scans every entry, picks the highest-priority PENDING one, then
//! claims it:
//!
//! 1. take `claim.lock` with `create_new` (fails if another claimant holds it)
//! 2. re-read the status and give up unless it is still PENDING
//! 3. atomically replace the status with IN_PROGRESS
//! 4. drop `claim.lock`
//!
//! A claimant that loses at step 1 or 2 returns `None` and waits for the next
//! poll instead of retrying on the spot.

use std::cmp::Reverse;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::state::{JobErrorInfo, JobState, JobStatus};
use super::status::StatusStore;
use crate::error::{JobError, StoreError, codes};
use crate::store::fs::{read_json, remove_if_exists, write_json_atomic};
use crate::store::{ConversationId, Layout};

/// Default retry budget for a descriptor built with [`JobDescriptor::new`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Queued unit of work. Exists until the job is terminally resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub conversation_id: ConversationId,
    pub tool_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

impl JobDescriptor {
    pub fn new(
        conversation_id: ConversationId,
        tool_name: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            conversation_id,
            tool_name: tool_name.into(),
            params,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Reject descriptors no worker could ever run.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.tool_name.trim().is_empty() {
            return Err(JobError::Validation {
                reason: "tool name must not be empty".to_string(),
            });
        }
        if !(self.params.is_object() || self.params.is_null()) {
            return Err(JobError::Validation {
                reason: "params must be a JSON object".to_string(),
            });
        }
        if self.attempts > self.max_attempts {
            return Err(JobError::Validation {
                reason: format!(
                    "attempts ({}) exceeds max attempts ({})",
                    self.attempts, self.max_attempts
                ),
            });
        }
        Ok(())
    }
}

/// Claim markers younger than this are never swept, whatever the stall
/// threshold, so a live claimant in another process keeps its marker.
const CLAIM_MARKER_MIN_AGE: Duration = Duration::from_secs(30);

/// Exclusive claim marker. Release it with [`ClaimGuard::release`]; if the
/// holder is dropped without releasing (panic, cancelled future) removal is
/// handed to a background task.
struct ClaimGuard {
    path: Option<PathBuf>,
}

impl ClaimGuard {
    async fn release(mut self) {
        if let Some(path) = self.path.take() {
            remove_claim_marker(&path).await;
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_claim_marker(&path).await });
            }
            Err(_) => warn!(path = %path.display(), "Claim marker left behind outside a runtime"),
        }
    }
}

async fn remove_claim_marker(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to release claim marker");
    }
}

/// File-backed job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    layout: Layout,
    statuses: StatusStore,
    worker_id: String,
}

impl JobQueue {
    pub fn new(layout: Layout) -> Self {
        let worker_id = format!(
            "{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            statuses: StatusStore::new(layout.clone()),
            layout,
            worker_id,
        }
    }

    /// Identity written into claims made through this queue.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    /// Queue `descriptor`, replacing any descriptor already queued for the
    /// same conversation.
    pub async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), JobError> {
        descriptor.validate()?;
        let dir = self.layout.entry_dir(&descriptor.conversation_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?;
        write_json_atomic(&self.layout.job_file(&descriptor.conversation_id), descriptor).await?;
        info!(
            conversation_id = %descriptor.conversation_id,
            tool = %descriptor.tool_name,
            priority = descriptor.priority,
            "Job enqueued"
        );
        Ok(())
    }

    /// Read the descriptor queued for `id`, if any.
    pub async fn get_job(&self, id: &ConversationId) -> Result<Option<JobDescriptor>, StoreError> {
        read_json(&self.layout.job_file(id)).await
    }

    pub async fn get_status(&self, id: &ConversationId) -> Result<Option<JobStatus>, StoreError> {
        self.statuses.get(id).await
    }

    /// Publish a status snapshot.
    pub async fn update_status(&self, status: &JobStatus) -> Result<(), StoreError> {
        self.statuses.write(status).await
    }

    /// Drop the descriptor; the status record stays for later queries.
    pub async fn remove_job(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let removed = remove_if_exists(&self.layout.job_file(id)).await?;
        if removed {
            debug!(conversation_id = %id, "Job descriptor removed");
        }
        Ok(removed)
    }

    /// Scan for the best PENDING job and claim it.
    pub async fn dequeue(&self) -> Result<Option<JobDescriptor>, StoreError> {
        let Some(candidate) = self.select_candidate().await? else {
            return Ok(None);
        };
        match self.claim(&candidate).await {
            Ok(Some(_)) => Ok(Some(candidate)),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(
                    conversation_id = %candidate.conversation_id,
                    error = %e,
                    "Claim failed"
                );
                Ok(None)
            }
        }
    }

    /// Scan phase: highest priority wins, oldest first among equals.
    async fn select_candidate(&self) -> Result<Option<JobDescriptor>, StoreError> {
        let now = Utc::now();
        let mut best: Option<JobDescriptor> = None;

        for id in self.layout.list_ids().await? {
            let descriptor = match self.get_job(&id).await {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping unreadable job descriptor");
                    continue;
                }
            };
            let status = match self.statuses.get(&id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping unreadable job status");
                    continue;
                }
            };
            if !status.is_claimable_at(now) {
                continue;
            }

            let key = |d: &JobDescriptor| (d.priority, Reverse(d.created_at));
            if best.as_ref().is_none_or(|b| key(&descriptor) > key(b)) {
                best = Some(descriptor);
            }
        }
        Ok(best)
    }

    async fn acquire_claim(&self, id: &ConversationId) -> Result<Option<ClaimGuard>, StoreError> {
        let path = self.layout.claim_file(id);
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match opened {
            Ok(mut file) => {
                let guard = ClaimGuard { path: Some(path) };
                // Informational only; the marker's existence is what counts.
                let _ = file.write_all(self.worker_id.as_bytes()).await;
                Ok(Some(guard))
            }
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) => {
                Ok(None)
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Claim phase: flip `descriptor`'s status from PENDING to IN_PROGRESS.
    ///
    /// Returns the new status if this caller won, `None` if another worker
    /// got there first or the job is no longer pending.
    pub async fn claim(&self, descriptor: &JobDescriptor) -> Result<Option<JobStatus>, JobError> {
        let id = &descriptor.conversation_id;
        let Some(guard) = self.acquire_claim(id).await? else {
            debug!(conversation_id = %id, "Claim marker held elsewhere, backing off");
            return Ok(None);
        };
        let result = self.claim_locked(descriptor).await;
        guard.release().await;
        result
    }

    async fn claim_locked(&self, descriptor: &JobDescriptor) -> Result<Option<JobStatus>, JobError> {
        let id = &descriptor.conversation_id;
        let Some(mut status) = self.statuses.get(id).await? else {
            return Ok(None);
        };
        if status.state() != JobState::Pending {
            debug!(conversation_id = %id, status = %status.state(), "Lost claim race");
            return Ok(None);
        }

        status.claim(self.worker_id.as_str())?;
        self.statuses.write(&status).await?;
        info!(
            conversation_id = %id,
            tool = %descriptor.tool_name,
            worker = %self.worker_id,
            "Job claimed"
        );
        Ok(Some(status))
    }

    /// Cancel a job that has not started. Running jobs are never preempted.
    pub async fn cancel(&self, id: &ConversationId) -> Result<JobStatus, JobError> {
        let Some(guard) = self.acquire_claim(id).await? else {
            return Err(JobError::NotCancellable {
                id: id.to_string(),
                state: "being claimed".to_string(),
            });
        };
        let result = self.cancel_locked(id).await;
        guard.release().await;
        result
    }

    async fn cancel_locked(&self, id: &ConversationId) -> Result<JobStatus, JobError> {
        let mut status = self
            .statuses
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        if status.state() != JobState::Pending {
            return Err(JobError::NotCancellable {
                id: id.to_string(),
                state: status.state().to_string(),
            });
        }

        status.mark_cancelled()?;
        self.statuses.write(&status).await?;
        self.remove_job(id).await?;
        info!(conversation_id = %id, "Job cancelled");
        Ok(status)
    }

    /// Conversations whose job is PENDING or IN_PROGRESS.
    pub async fn list_active(&self) -> Result<Vec<ConversationId>, StoreError> {
        let mut active = Vec::new();
        for id in self.layout.list_ids().await? {
            match self.statuses.get(&id).await {
                Ok(Some(status)) if status.state().is_active() => active.push(id),
                Ok(_) => {}
                Err(e) => warn!(conversation_id = %id, error = %e, "Skipping unreadable job status"),
            }
        }
        Ok(active)
    }

    /// Demote IN_PROGRESS jobs not updated within `threshold` back to
    /// PENDING. Returns how many were recovered.
    pub async fn recover_stalled(&self, threshold: Duration) -> Result<usize, StoreError> {
        let marker_age = chrono::Duration::from_std(threshold.max(CLAIM_MARKER_MIN_AGE))
            .unwrap_or(chrono::Duration::MAX);
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let mut recovered = 0;

        for id in self.layout.list_ids().await? {
            self.clear_stale_claim(&id, marker_age).await;

            let status = match self.statuses.get(&id).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping unreadable job status");
                    continue;
                }
            };
            if !is_stalled(&status, threshold) {
                continue;
            }

            match self.requeue(&id, threshold).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => warn!(conversation_id = %id, error = %e, "Failed to recover stalled job"),
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    async fn requeue(&self, id: &ConversationId, threshold: chrono::Duration) -> Result<bool, JobError> {
        let Some(guard) = self.acquire_claim(id).await? else {
            return Ok(false);
        };
        let result = self.requeue_locked(id, threshold).await;
        guard.release().await;
        result
    }

    async fn requeue_locked(
        &self,
        id: &ConversationId,
        threshold: chrono::Duration,
    ) -> Result<bool, JobError> {
        let Some(mut status) = self.statuses.get(id).await? else {
            return Ok(false);
        };
        if !is_stalled(&status, threshold) {
            return Ok(false);
        }

        let idle_ms = Utc::now()
            .signed_duration_since(status.updated_at)
            .num_milliseconds();
        let note = JobErrorInfo::new(
            codes::STALLED,
            format!("no status update for {idle_ms}ms; returned to queue"),
            status.attempts,
        );
        status.requeue_stalled(note)?;
        self.statuses.write(&status).await?;
        warn!(conversation_id = %id, idle_ms, "Stalled job returned to queue");
        Ok(true)
    }

    /// Remove a claim marker left behind by a claimant that died mid-claim.
    async fn clear_stale_claim(&self, id: &ConversationId, min_age: chrono::Duration) {
        let path = self.layout.claim_file(id);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return;
        };
        let Ok(modified) = meta.modified() else {
            return;
        };
        let age = DateTime::<Utc>::from(modified);
        if Utc::now().signed_duration_since(age) >= min_age {
            match remove_if_exists(&path).await {
                Ok(true) => warn!(conversation_id = %id, "Removed stale claim marker"),
                Ok(false) => {}
                Err(e) => warn!(conversation_id = %id, error = %e, "Failed to remove stale claim marker"),
            }
        }
    }
}

fn is_stalled(status: &JobStatus, threshold: chrono::Duration) -> bool {
    status.state() == JobState::InProgress
        && Utc::now().signed_duration_since(status.updated_at) >= threshold
}
