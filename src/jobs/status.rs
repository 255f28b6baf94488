//! StatusStore: one atomically replaced `status.json` per conversation.

use tracing::debug;

use super::state::{JobErrorInfo, JobStatus};
use crate::error::{JobError, StoreError};
use crate::store::fs::{read_json, write_json_atomic};
use crate::store::{ConversationId, Layout};

/// File-backed job status records.
#[derive(Debug, Clone)]
pub struct StatusStore {
    layout: Layout,
}

impl StatusStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Record a fresh PENDING status for `conversation_id`.
    pub async fn create(
        &self,
        conversation_id: &ConversationId,
        tool_name: &str,
    ) -> Result<JobStatus, StoreError> {
        let status = JobStatus::new(conversation_id.clone(), tool_name);
        self.write(&status).await?;
        Ok(status)
    }

    /// Read the status record, if the conversation has one.
    pub async fn get(&self, id: &ConversationId) -> Result<Option<JobStatus>, StoreError> {
        let path = self.layout.status_file(id);
        let Some(status) = read_json::<JobStatus>(&path).await? else {
            return Ok(None);
        };
        if status.conversation_id != *id {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("record claims conversation {}", status.conversation_id),
            });
        }
        Ok(Some(status))
    }

    /// Atomically publish `status`, replacing any previous record.
    pub async fn write(&self, status: &JobStatus) -> Result<(), StoreError> {
        let path = self.layout.status_file(&status.conversation_id);
        write_json_atomic(&path, status).await?;
        debug!(
            conversation_id = %status.conversation_id,
            status = %status.state(),
            "Job status written"
        );
        Ok(())
    }

    /// Load, apply `f`, and write back. Nothing is written if `f` fails.
    pub async fn update<F>(&self, id: &ConversationId, f: F) -> Result<JobStatus, JobError>
    where
        F: FnOnce(&mut JobStatus) -> Result<(), JobError>,
    {
        let mut status = self
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
        f(&mut status)?;
        self.write(&status).await?;
        Ok(status)
    }

    pub async fn mark_in_progress(
        &self,
        id: &ConversationId,
        message: &str,
        percentage: Option<u8>,
    ) -> Result<JobStatus, JobError> {
        self.update(id, |s| s.mark_in_progress(message, percentage))
            .await
    }

    pub async fn mark_completed(&self, id: &ConversationId) -> Result<JobStatus, JobError> {
        self.update(id, |s| s.mark_completed()).await
    }

    pub async fn mark_failed(
        &self,
        id: &ConversationId,
        error: JobErrorInfo,
    ) -> Result<JobStatus, JobError> {
        self.update(id, |s| s.mark_failed(error)).await
    }

    pub async fn mark_for_retry(
        &self,
        id: &ConversationId,
        error: JobErrorInfo,
        retry_after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<JobStatus, JobError> {
        self.update(id, |s| s.mark_for_retry(error, retry_after))
            .await
    }

    pub async fn mark_cancelled(&self, id: &ConversationId) -> Result<JobStatus, JobError> {
        self.update(id, |s| s.mark_cancelled()).await
    }
}
