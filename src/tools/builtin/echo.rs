//! Echo executor, mostly useful for smoke-testing a deployment.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::tools::executor::{ExecutionContext, Executor, require_str};

/// Returns its `text` parameter, optionally after `delay_ms`.
#[derive(Debug, Default)]
pub struct EchoExecutor;

impl EchoExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the `text` parameter back, optionally after `delay_ms` milliseconds"
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        let text = require_str(&params, "text")?;
        if let Some(delay) = params.get("delay_ms").and_then(|v| v.as_u64()) {
            ctx.progress("waiting", Some(50)).await;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(text.to_string())
    }
}
