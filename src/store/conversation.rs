//! ConversationStore: append-only transcripts persisted as JSON files.
//!
//! Appends are not serialized here. While a job is in progress the worker
//! that claimed it is the only writer of its conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fs::{read_json, write_json_atomic};
use super::{ConversationId, Layout};
use crate::error::StoreError;

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        };
        write!(f, "{s}")
    }
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A persisted transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    fn new(id: ConversationId, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            messages,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append `message`, or with `partial` extend the last message when it
    /// has the same role. `updated_at` never moves backwards.
    pub fn push(&mut self, message: Message, partial: bool) {
        match self.messages.last_mut() {
            Some(last) if partial && last.role == message.role => {
                last.content.push_str(&message.content);
            }
            _ => self.messages.push(message),
        }
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

/// File-backed conversation storage.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    layout: Layout,
}

impl ConversationStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Persist a new conversation under a freshly allocated id.
    pub async fn create(&self, messages: Vec<Message>) -> Result<Conversation, StoreError> {
        self.layout.ensure_dirs().await?;
        let id = self.allocate_id().await?;
        let conversation = Conversation::new(id, messages);
        write_json_atomic(&self.layout.conversation_file(&conversation.id), &conversation).await?;
        info!(
            conversation_id = %conversation.id,
            messages = conversation.messages.len(),
            "Conversation created"
        );
        Ok(conversation)
    }

    /// Reserve an entry directory. Directory creation is exclusive, so a
    /// concurrent process that picked the same id forces a regenerate.
    async fn allocate_id(&self) -> Result<ConversationId, StoreError> {
        const MAX_TRIES: usize = 16;
        let mut last_err = None;
        for _ in 0..MAX_TRIES {
            let id = ConversationId::generate();
            let dir = self.layout.entry_dir(&id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(conversation_id = %id, "Id already taken, regenerating");
                    last_err = Some(StoreError::io(dir, e));
                }
                Err(e) => return Err(StoreError::io(dir, e)),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StoreError::io(
                self.layout.conversations_dir(),
                std::io::Error::other("could not allocate a conversation id"),
            )
        }))
    }

    /// Load a conversation by raw id.
    pub async fn load_str(&self, raw: &str) -> Result<Conversation, StoreError> {
        let id = ConversationId::parse(raw)?;
        self.load(&id).await
    }

    /// Load a conversation.
    pub async fn load(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        let path = self.layout.conversation_file(id);
        let conversation: Conversation =
            read_json(&path)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    id: id.to_string(),
                })?;

        if conversation.id != *id {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("record claims id {}", conversation.id),
            });
        }
        if conversation.updated_at < conversation.created_at {
            return Err(StoreError::Corrupted {
                path,
                reason: "updatedAt precedes createdAt".to_string(),
            });
        }
        Ok(conversation)
    }

    /// Append a message and atomically rewrite the transcript.
    pub async fn append(
        &self,
        id: &ConversationId,
        message: Message,
        partial: bool,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.load(id).await?;
        conversation.push(message, partial);
        write_json_atomic(&self.layout.conversation_file(id), &conversation).await?;
        debug!(
            conversation_id = %id,
            messages = conversation.messages.len(),
            partial,
            "Conversation appended"
        );
        Ok(conversation)
    }

    /// Where the transcript for `id` lives, for human-facing reporting.
    pub fn path_for(&self, id: &ConversationId) -> std::path::PathBuf {
        self.layout.conversation_file(id)
    }
}
