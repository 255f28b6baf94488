//! Shell command executor.
//!
//! Runs `sh -c <command>` (or `cmd /C` on Windows) and returns stdout.
//! A non-zero exit is a `COMMAND_FAILED` error carrying stderr, so it goes
//! through the normal retry policy.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ExecutionError, codes};
use crate::tools::executor::{ExecutionContext, Executor, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Shell command executor. Commands run in the process's working directory
/// unless the job passes `workdir`.
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(cmd: &str) -> Command {
        if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        }
    }
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated, {} bytes total)", &s[..end], s.len())
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its stdout. Optional `workdir` and `timeout_secs`."
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        let cmd = require_str(&params, "command")?;
        let workdir = params
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        let timeout = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);

        let mut command = Self::command(cmd);
        if let Some(dir) = &workdir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            ExecutionError::new(codes::COMMAND_FAILED, format!("Failed to spawn command: {e}"))
        })?;
        ctx.progress("command running", None).await;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    ExecutionError::new("TIMEOUT", format!("Command timed out after {limit:?}"))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| {
            ExecutionError::new(codes::COMMAND_FAILED, format!("Command execution failed: {e}"))
        })?;

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        if output.status.success() {
            return Ok(stdout);
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        Err(
            ExecutionError::new(codes::COMMAND_FAILED, format!("Command exited with status {code}"))
                .with_details(serde_json::json!({ "exit_code": code, "stdout": stdout }))
                .with_stack(stderr),
        )
    }
}
