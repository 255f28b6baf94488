//! Error types for offload.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the file-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid conversation id: {id}")]
    InvalidIdentifier { id: String },

    #[error("Conversation {id} not found")]
    NotFound { id: String },

    #[error(
        "Corrupted record at {}: {reason}. Remove it and restart the request with a fresh conversation",
        path.display()
    )]
    Corrupted { path: PathBuf, reason: String },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Job queue and state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {reason}")]
    Validation { reason: String },

    #[error("No executor registered for tool {name}")]
    UnknownTool { name: String },

    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("No job status recorded for conversation {id}")]
    NotFound { id: String },

    #[error("Job {id} is {state} and cannot be cancelled")]
    NotCancellable { id: String, state: String },

    #[error("Timed out waiting for {pending} job(s) to finish")]
    AwaitTimedOut { pending: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure raised by an executor while performing a job.
///
/// `code` is a stable machine-readable identifier; `details` carries any
/// structured context the executor wants recorded in the job's error history.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            stack: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Parameters did not match what the executor expects.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }
}

/// Well-known error codes recorded in job error history.
pub mod codes {
    pub const UNKNOWN_TOOL: &str = "UNKNOWN_TOOL";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const EXECUTOR_PANIC: &str = "EXECUTOR_PANIC";
    pub const COMMAND_FAILED: &str = "COMMAND_FAILED";
    pub const STALLED: &str = "STALLED";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
}
