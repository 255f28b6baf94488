//! Caller-facing facade over the conversation store and job queue.
//!
//! This is what a request/response tool server talks to: it creates
//! conversations, submits work, reads status, and awaits batches of jobs.
//! Execution itself happens in whichever process runs a
//! [`Scheduler`](crate::worker::Scheduler) against the same storage root.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{JobError, StoreError};
use crate::jobs::{JobDescriptor, JobQueue, JobStatus};
use crate::store::{Conversation, ConversationId, ConversationStore, Layout, Message};

/// A unit of work to run in the background.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub tool_name: String,
    pub params: serde_json::Value,
    /// Seed transcript for the new conversation.
    pub messages: Vec<Message>,
    pub priority: i32,
    /// Falls back to the service default when unset.
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn new(tool_name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            messages: Vec::new(),
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Conversation and job operations bound to one storage root.
#[derive(Debug, Clone)]
pub struct JobService {
    conversations: ConversationStore,
    queue: JobQueue,
    default_max_attempts: u32,
}

impl JobService {
    pub fn new(config: &StoreConfig) -> Self {
        let layout = Layout::new(config.root.clone());
        Self {
            conversations: ConversationStore::new(layout.clone()),
            queue: JobQueue::new(layout),
            default_max_attempts: config.default_max_attempts,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    // ── Conversations ───────────────────────────────────────────────

    pub async fn create_conversation(
        &self,
        messages: Vec<Message>,
    ) -> Result<Conversation, StoreError> {
        self.conversations.create(messages).await
    }

    /// Create a conversation together with a PENDING status for `tool_name`.
    /// No descriptor is queued; pair with [`JobService::enqueue`].
    pub async fn create_conversation_with_status(
        &self,
        messages: Vec<Message>,
        tool_name: &str,
    ) -> Result<(Conversation, JobStatus), StoreError> {
        let conversation = self.conversations.create(messages).await?;
        let status = self
            .queue
            .statuses()
            .create(&conversation.id, tool_name)
            .await?;
        Ok((conversation, status))
    }

    pub async fn load_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.conversations.load_str(id).await
    }

    pub async fn append_to_conversation(
        &self,
        id: &str,
        message: Message,
        partial: bool,
    ) -> Result<Conversation, StoreError> {
        let id = ConversationId::parse(id)?;
        self.conversations.append(&id, message, partial).await
    }

    pub fn conversation_path(&self, id: &ConversationId) -> PathBuf {
        self.conversations.path_for(id)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Create a conversation, record its PENDING status and queue the job.
    pub async fn submit(&self, request: JobRequest) -> Result<ConversationId, JobError> {
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);

        // Reject bad requests before anything lands on disk.
        let placeholder = ConversationId::generate();
        JobDescriptor::new(placeholder, &request.tool_name, request.params.clone())
            .with_max_attempts(max_attempts)
            .validate()?;

        let (conversation, _) = self
            .create_conversation_with_status(request.messages, &request.tool_name)
            .await?;
        let descriptor = JobDescriptor::new(conversation.id.clone(), request.tool_name, request.params)
            .with_priority(request.priority)
            .with_max_attempts(max_attempts);
        self.queue.enqueue(&descriptor).await?;

        info!(
            conversation_id = %conversation.id,
            tool = %descriptor.tool_name,
            "Job submitted"
        );
        Ok(conversation.id)
    }

    pub async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), JobError> {
        self.queue.enqueue(descriptor).await
    }

    pub async fn dequeue(&self) -> Result<Option<JobDescriptor>, StoreError> {
        self.queue.dequeue().await
    }

    /// Current status of the job attached to `id`.
    pub async fn get_status(&self, id: &str) -> Result<JobStatus, JobError> {
        let id = ConversationId::parse(id)?;
        self.queue
            .get_status(&id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })
    }

    pub async fn list_active(&self) -> Result<Vec<ConversationId>, StoreError> {
        self.queue.list_active().await
    }

    pub async fn recover_stalled(&self, threshold: Duration) -> Result<usize, StoreError> {
        self.queue.recover_stalled(threshold).await
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel(&self, id: &str) -> Result<JobStatus, JobError> {
        let id = ConversationId::parse(id)?;
        self.queue.cancel(&id).await
    }

    /// Poll until every job in `ids` is terminal, returning their final
    /// statuses in the order given. `None` waits indefinitely.
    pub async fn await_all(
        &self,
        ids: &[ConversationId],
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Vec<JobStatus>, JobError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut statuses = Vec::with_capacity(ids.len());
            for id in ids {
                let status = self
                    .queue
                    .get_status(id)
                    .await?
                    .ok_or_else(|| JobError::NotFound { id: id.to_string() })?;
                statuses.push(status);
            }

            let pending = statuses.iter().filter(|s| !s.is_terminal()).count();
            if pending == 0 {
                return Ok(statuses);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(JobError::AwaitTimedOut { pending });
            }
            debug!(pending, total = ids.len(), "Waiting for jobs");
            tokio::time::sleep(poll_interval).await;
        }
    }
}
