//! Per-job worker execution.
//!
//! A [`Worker`] runs one claimed job to its outcome: progress milestones,
//! executor invocation, transcript update, and the retry-or-fail decision.
//! Every status write is awaited before the next step so readers never see
//! progress go backwards.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{ExecutionError, codes};
use crate::jobs::{JobDescriptor, JobErrorInfo, JobQueue, JobStatus};
use crate::store::{ConversationId, ConversationStore, Message};
use crate::tools::{ExecutionContext, ExecutorRegistry, ProgressReporter};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: JobQueue,
    pub conversations: ConversationStore,
    pub executors: Arc<ExecutorRegistry>,
    pub config: WorkerConfig,
}

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Result appended, status COMPLETED, descriptor removed.
    Completed,
    /// Back to PENDING with this many attempts recorded.
    Retrying { attempts: u32 },
    /// Status FAILED, descriptor removed.
    Failed { code: String },
    /// Nothing to do: no status record, or the job was already resolved.
    Skipped,
    /// The outcome could not be recorded. Status stays IN_PROGRESS and the
    /// descriptor stays queued, so stall recovery runs the job again.
    Abandoned,
}

/// Worker that executes a single job.
pub struct Worker {
    job: JobDescriptor,
    deps: WorkerDeps,
}

impl Worker {
    /// Create a new worker for a specific job.
    pub fn new(job: JobDescriptor, deps: WorkerDeps) -> Self {
        Self { job, deps }
    }

    fn id(&self) -> &ConversationId {
        &self.job.conversation_id
    }

    fn queue(&self) -> &JobQueue {
        &self.deps.queue
    }

    /// Milestone update; a failed write is logged, not fatal.
    async fn milestone(&self, message: &str, percentage: u8) -> Option<JobStatus> {
        match self
            .queue()
            .statuses()
            .mark_in_progress(self.id(), message, Some(percentage))
            .await
        {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(conversation_id = %self.id(), error = %e, "Failed to record progress");
                None
            }
        }
    }

    /// Run the job to an outcome. Never panics on executor failure.
    pub async fn run(self) -> JobOutcome {
        let id = self.id().clone();

        match self.queue().get_status(&id).await {
            Ok(Some(status)) if !status.is_terminal() => {}
            Ok(Some(status)) => {
                debug!(conversation_id = %id, status = %status.state(), "Job already resolved");
                return JobOutcome::Skipped;
            }
            Ok(None) => {
                debug!(conversation_id = %id, "Job status gone, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                warn!(conversation_id = %id, error = %e, "Could not read job status");
                return JobOutcome::Skipped;
            }
        }

        let Some(status) = self.milestone("starting", 0).await else {
            return JobOutcome::Skipped;
        };
        let attempt = status.attempts;

        let executor = match self.deps.executors.resolve(&self.job.tool_name).await {
            Ok(executor) => executor,
            Err(e) => {
                let error = JobErrorInfo::new(codes::UNKNOWN_TOOL, e.to_string(), attempt);
                return self.fail(error).await;
            }
        };

        let ctx = ExecutionContext::new(
            id.clone(),
            &self.job.tool_name,
            attempt,
            ProgressReporter::new(self.queue().statuses().clone(), id.clone()),
        );

        self.milestone("executing", 25).await;
        info!(
            conversation_id = %id,
            tool = %self.job.tool_name,
            attempt,
            "Executing job"
        );

        let result = AssertUnwindSafe(executor.execute(self.job.params.clone(), &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "executor panicked".to_string());
                Err(ExecutionError::new(codes::EXECUTOR_PANIC, message))
            });

        match result {
            Ok(output) => self.complete(output).await,
            Err(e) => {
                self.handle_failure(JobErrorInfo::from_execution(&e, attempt))
                    .await
            }
        }
    }

    async fn complete(&self, output: String) -> JobOutcome {
        let id = self.id();
        self.milestone("finalizing", 90).await;

        if let Err(e) = self
            .deps
            .conversations
            .append(id, Message::assistant(output), false)
            .await
        {
            let attempt = self.current_attempts().await;
            let error = JobErrorInfo::new(codes::STORAGE_ERROR, e.to_string(), attempt);
            return self.handle_failure(error).await;
        }

        if let Err(e) = self.queue().statuses().mark_completed(id).await {
            error!(conversation_id = %id, error = %e, "Failed to mark job completed");
            return self.settle_unrecorded().await;
        }
        self.remove_descriptor().await;
        info!(conversation_id = %id, "Job completed");
        JobOutcome::Completed
    }

    async fn current_attempts(&self) -> u32 {
        match self.queue().get_status(self.id()).await {
            Ok(Some(s)) => s.attempts,
            _ => self.job.attempts,
        }
    }

    /// Retry while the budget lasts, otherwise fail for good.
    async fn handle_failure(&self, error: JobErrorInfo) -> JobOutcome {
        let id = self.id();
        let attempts = error.attempt;
        if attempts >= self.job.max_attempts {
            return self.fail(error).await;
        }

        let retry_after = self.retry_after(attempts + 1);
        warn!(
            conversation_id = %id,
            code = %error.code,
            attempt = attempts,
            max_attempts = self.job.max_attempts,
            "Job failed, scheduling retry"
        );

        // The descriptor is rewritten while the status is still IN_PROGRESS,
        // so no other worker can claim and resolve the job in between.
        let mut descriptor = self.job.clone();
        descriptor.attempts = attempts + 1;
        if let Err(e) = self.queue().enqueue(&descriptor).await {
            warn!(conversation_id = %id, error = %e, "Failed to update job descriptor");
        }

        match self
            .queue()
            .statuses()
            .mark_for_retry(id, error, retry_after)
            .await
        {
            Ok(status) => JobOutcome::Retrying {
                attempts: status.attempts,
            },
            Err(e) => {
                error!(conversation_id = %id, error = %e, "Failed to schedule retry");
                self.settle_unrecorded().await
            }
        }
    }

    /// A status write failed. If the job was resolved elsewhere in the
    /// meantime its descriptor must go; otherwise leave both files for stall
    /// recovery.
    async fn settle_unrecorded(&self) -> JobOutcome {
        match self.queue().get_status(self.id()).await {
            Ok(Some(status)) if status.is_terminal() => {
                self.remove_descriptor().await;
                JobOutcome::Skipped
            }
            Ok(None) => {
                self.remove_descriptor().await;
                JobOutcome::Skipped
            }
            _ => JobOutcome::Abandoned,
        }
    }

    async fn fail(&self, error: JobErrorInfo) -> JobOutcome {
        let id = self.id();
        let code = error.code.clone();
        error!(
            conversation_id = %id,
            code = %code,
            message = %error.message,
            "Job failed permanently"
        );
        if let Err(e) = self.queue().statuses().mark_failed(id, error).await {
            error!(conversation_id = %id, error = %e, "Failed to mark job failed");
            return self.settle_unrecorded().await;
        }
        self.remove_descriptor().await;
        JobOutcome::Failed { code }
    }

    async fn remove_descriptor(&self) {
        if let Err(e) = self.queue().remove_job(self.id()).await {
            warn!(conversation_id = %self.id(), error = %e, "Failed to remove job descriptor");
        }
    }

    fn retry_after(&self, attempt: u32) -> Option<chrono::DateTime<Utc>> {
        let delay = self.deps.config.backoff_for(attempt);
        if delay.is_zero() {
            return None;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=(delay.as_millis() as u64 / 10));
        let delay = chrono::Duration::from_std(delay).ok()?
            + chrono::Duration::milliseconds(jitter_ms as i64);
        Some(Utc::now() + delay)
    }
}
