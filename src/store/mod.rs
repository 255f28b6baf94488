//! Persistence layer: one directory per conversation under a shared root.
//!
//! ```text
//! <root>/conversations/<id>/
//!     conversation.json   transcript
//!     status.json         job state machine snapshot (optional)
//!     job.json            queued job descriptor (present while queued or running)
//!     claim.lock          transient marker held while a worker claims the job
//! ```

pub mod conversation;
pub mod fs;
pub mod id;

use std::path::{Path, PathBuf};

pub use conversation::{Conversation, ConversationStore, Message, Role};
pub use id::ConversationId;

use crate::error::StoreError;

const CONVERSATIONS_DIR: &str = "conversations";
const CONVERSATION_FILE: &str = "conversation.json";
const STATUS_FILE: &str = "status.json";
const JOB_FILE: &str = "job.json";
const CLAIM_FILE: &str = "claim.lock";

/// Deterministic mapping from conversation ids to paths on disk.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every conversation entry.
    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join(CONVERSATIONS_DIR)
    }

    pub fn entry_dir(&self, id: &ConversationId) -> PathBuf {
        self.conversations_dir().join(id.as_str())
    }

    pub fn conversation_file(&self, id: &ConversationId) -> PathBuf {
        self.entry_dir(id).join(CONVERSATION_FILE)
    }

    pub fn status_file(&self, id: &ConversationId) -> PathBuf {
        self.entry_dir(id).join(STATUS_FILE)
    }

    pub fn job_file(&self, id: &ConversationId) -> PathBuf {
        self.entry_dir(id).join(JOB_FILE)
    }

    pub fn claim_file(&self, id: &ConversationId) -> PathBuf {
        self.entry_dir(id).join(CLAIM_FILE)
    }

    /// Create the conversations directory if needed.
    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        let dir = self.conversations_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir, e))
    }

    /// Every well-formed conversation id present on disk, in lexical order.
    ///
    /// Entries whose names are not conversation ids are skipped.
    pub async fn list_ids(&self) -> Result<Vec<ConversationId>, StoreError> {
        let dir = self.conversations_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut ids = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    match ConversationId::parse(name) {
                        Ok(id) => ids.push(id),
                        Err(_) => tracing::debug!(entry = %name, "Skipping non-conversation entry"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
