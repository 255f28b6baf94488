//! Job state machine.
//!
//! ```text
//! PENDING ──claim──▶ IN_PROGRESS ──▶ COMPLETED | FAILED
//!    ▲                    │
//!    └──retry / stalled───┘
//! PENDING | IN_PROGRESS ──▶ CANCELLED
//! ```
//!
//! The per-state payload lives in [`JobPhase`], so a pending job cannot carry
//! progress and only a failed job carries a terminal error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, JobError};
use crate::store::ConversationId;

/// State of a job, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for a worker to claim it.
    Pending,
    /// Claimed and executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Withdrawn before it ran to completion.
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, InProgress) | (Pending, Cancelled) |
            // From InProgress (progress updates stay in place)
            (InProgress, InProgress) |
            (InProgress, Completed) | (InProgress, Failed) |
            (InProgress, Pending) | (InProgress, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Liveness report for an in-progress job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub message: String,
    /// 0..=100
    pub percentage: u8,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

impl Progress {
    fn new(message: impl Into<String>, percentage: u8, elapsed_ms: u64) -> Self {
        let percentage = percentage.min(100);
        let estimated_remaining_ms = match percentage {
            0 | 100 => None,
            p => Some(elapsed_ms.saturating_mul(u64::from(100 - p)) / u64::from(p)),
        };
        Self {
            message: message.into(),
            percentage,
            elapsed_ms,
            estimated_remaining_ms,
        }
    }
}

/// Structured record of one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Value of `attempts` when the error happened.
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            stack_trace: None,
            attempt,
            occurred_at: Utc::now(),
        }
    }

    pub fn from_execution(error: &ExecutionError, attempt: u32) -> Self {
        Self {
            code: error.code.clone(),
            message: error.message.clone(),
            details: error.details.clone(),
            stack_trace: error.stack.clone(),
            attempt,
            occurred_at: Utc::now(),
        }
    }
}

/// State plus the payload that only makes sense in that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    #[serde(rename_all = "camelCase")]
    Pending {
        /// Earliest time a worker may claim the job again.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    InProgress {
        progress: Progress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claimed_by: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Completed { completed_at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Failed {
        completed_at: DateTime<Utc>,
        error: JobErrorInfo,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { completed_at: DateTime<Utc> },
}

impl JobPhase {
    pub fn state(&self) -> JobState {
        match self {
            Self::Pending { .. } => JobState::Pending,
            Self::InProgress { .. } => JobState::InProgress,
            Self::Completed { .. } => JobState::Completed,
            Self::Failed { .. } => JobState::Failed,
            Self::Cancelled { .. } => JobState::Cancelled,
        }
    }
}

/// Persisted job status for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub phase: JobPhase,
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of retries scheduled so far.
    pub attempts: u32,
    #[serde(default)]
    pub error_history: Vec<JobErrorInfo>,
}

impl JobStatus {
    /// A fresh pending status.
    pub fn new(conversation_id: ConversationId, tool_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            phase: JobPhase::Pending { retry_after: None },
            tool_name: tool_name.into(),
            started_at: now,
            updated_at: now,
            attempts: 0,
            error_history: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.phase.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn progress(&self) -> Option<&Progress> {
        match &self.phase {
            JobPhase::InProgress { progress, .. } => Some(progress),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobErrorInfo> {
        match &self.phase {
            JobPhase::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            JobPhase::Completed { completed_at }
            | JobPhase::Failed { completed_at, .. }
            | JobPhase::Cancelled { completed_at } => Some(*completed_at),
            _ => None,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match &self.phase {
            JobPhase::Pending { retry_after } => retry_after.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    fn touch(&mut self) -> DateTime<Utc> {
        let now = Utc::now().max(self.updated_at);
        self.updated_at = now;
        now
    }

    fn transition(&mut self, target: JobState, next: JobPhase) -> Result<(), JobError> {
        let current = self.state();
        if !current.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.conversation_id.to_string(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// PENDING → IN_PROGRESS on behalf of `worker`.
    pub fn claim(&mut self, worker: impl Into<String>) -> Result<(), JobError> {
        if self.state() != JobState::Pending {
            return Err(JobError::InvalidTransition {
                id: self.conversation_id.to_string(),
                from: self.state().to_string(),
                to: JobState::InProgress.to_string(),
            });
        }
        let now = self.touch();
        let progress = Progress::new("claimed", 0, self.elapsed_ms(now));
        self.transition(
            JobState::InProgress,
            JobPhase::InProgress {
                progress,
                claimed_by: Some(worker.into()),
            },
        )
    }

    /// Publish progress on a claimed job. Without a percentage the previous
    /// one is kept, and a lower percentage than already reported is raised to
    /// it. Only [`JobStatus::claim`] moves a job out of PENDING.
    pub fn mark_in_progress(
        &mut self,
        message: impl Into<String>,
        percentage: Option<u8>,
    ) -> Result<(), JobError> {
        let (previous, claimed_by) = match &self.phase {
            JobPhase::InProgress {
                progress,
                claimed_by,
            } => (progress.percentage, claimed_by.clone()),
            _ => {
                return Err(JobError::InvalidTransition {
                    id: self.conversation_id.to_string(),
                    from: self.state().to_string(),
                    to: JobState::InProgress.to_string(),
                });
            }
        };
        let percentage = percentage.unwrap_or(previous).max(previous);
        let now = self.touch();
        let progress = Progress::new(message, percentage, self.elapsed_ms(now));
        self.transition(
            JobState::InProgress,
            JobPhase::InProgress {
                progress,
                claimed_by,
            },
        )
    }

    pub fn mark_completed(&mut self) -> Result<(), JobError> {
        let completed_at = self.touch();
        self.transition(JobState::Completed, JobPhase::Completed { completed_at })
    }

    pub fn mark_failed(&mut self, error: JobErrorInfo) -> Result<(), JobError> {
        let completed_at = self.touch();
        self.transition(
            JobState::Failed,
            JobPhase::Failed {
                completed_at,
                error: error.clone(),
            },
        )?;
        self.error_history.push(error);
        Ok(())
    }

    /// IN_PROGRESS → PENDING, counting one more attempt.
    pub fn mark_for_retry(
        &mut self,
        error: JobErrorInfo,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        self.touch();
        self.transition(JobState::Pending, JobPhase::Pending { retry_after })?;
        self.attempts += 1;
        self.error_history.push(error);
        Ok(())
    }

    /// IN_PROGRESS → PENDING for a job whose worker went silent. Attempts are
    /// left alone; the stall is noted in the error history.
    pub fn requeue_stalled(&mut self, note: JobErrorInfo) -> Result<(), JobError> {
        if self.state() != JobState::InProgress {
            return Err(JobError::InvalidTransition {
                id: self.conversation_id.to_string(),
                from: self.state().to_string(),
                to: JobState::Pending.to_string(),
            });
        }
        self.touch();
        self.transition(JobState::Pending, JobPhase::Pending { retry_after: None })?;
        self.error_history.push(note);
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), JobError> {
        let completed_at = self.touch();
        self.transition(JobState::Cancelled, JobPhase::Cancelled { completed_at })
    }
}
