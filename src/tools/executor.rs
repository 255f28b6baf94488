//! Executor abstraction: the pluggable unit that performs a job's work.

use async_trait::async_trait;

use crate::error::{ExecutionError, JobError};
use crate::jobs::StatusStore;
use crate::store::ConversationId;

/// Publishes progress for the job an executor is running.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    statuses: StatusStore,
    conversation_id: ConversationId,
}

impl ProgressReporter {
    pub fn new(statuses: StatusStore, conversation_id: ConversationId) -> Self {
        Self {
            statuses,
            conversation_id,
        }
    }

    /// Write a progress update and wait for it to land on disk.
    pub async fn report(&self, message: &str, percentage: Option<u8>) -> Result<(), JobError> {
        self.statuses
            .mark_in_progress(&self.conversation_id, message, percentage)
            .await
            .map(|_| ())
    }
}

/// What an executor knows about the job it is running.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub conversation_id: ConversationId,
    pub tool_name: String,
    /// Retries already spent before this attempt.
    pub attempt: u32,
    progress: ProgressReporter,
}

impl ExecutionContext {
    pub fn new(
        conversation_id: ConversationId,
        tool_name: impl Into<String>,
        attempt: u32,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            conversation_id,
            tool_name: tool_name.into(),
            attempt,
            progress,
        }
    }

    /// Report progress; failures are logged rather than failing the job.
    pub async fn progress(&self, message: &str, percentage: Option<u8>) {
        if let Err(e) = self.progress.report(message, percentage).await {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                error = %e,
                "Failed to record executor progress"
            );
        }
    }
}

/// Performs the work behind one tool name.
///
/// Invoked once per attempt. Returning `Err` hands the failure to the
/// scheduler's retry policy.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Tool name this executor is registered under.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<String, ExecutionError>;
}

/// Fetch a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ExecutionError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExecutionError::invalid_params(format!("missing '{name}' parameter")))
}
