//! Executor registry: routes tool names to executors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::JobError;
use crate::tools::executor::Executor;

/// Registry of available executors, keyed by tool name.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executor, replacing any previous one with the same name.
    pub async fn register(&self, executor: Arc<dyn Executor>) {
        let name = executor.name().to_string();
        if self
            .executors
            .write()
            .await
            .insert(name.clone(), executor)
            .is_some()
        {
            tracing::warn!(tool = %name, "Replaced previously registered executor");
        }
        tracing::debug!("Registered executor: {}", name);
    }

    /// Register an executor (sync version for startup).
    pub fn register_sync(&self, executor: Arc<dyn Executor>) {
        let name = executor.name().to_string();
        if let Ok(mut executors) = self.executors.try_write() {
            executors.insert(name.clone(), executor);
            tracing::debug!("Registered executor: {}", name);
        }
    }

    /// Get an executor by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.read().await.get(name).cloned()
    }

    /// Get an executor or fail with `UnknownTool`.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Executor>, JobError> {
        self.get(name).await.ok_or_else(|| JobError::UnknownTool {
            name: name.to_string(),
        })
    }

    /// List all tool names.
    pub async fn list(&self) -> Vec<String> {
        self.executors.read().await.keys().cloned().collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
