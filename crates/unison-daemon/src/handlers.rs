use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use unison_coord::{JobError, JobHandler, JobRegistry};

/// Logs the `message` field of the rule params. The simplest possible
/// job body — useful for verifying a deployment end to end.
struct LogMessage;

#[async_trait]
impl JobHandler for LogMessage {
    async fn run(&self, params: &serde_json::Value) -> Result<(), JobError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        info!(message, "log_message job fired");
        Ok(())
    }
}

/// Runs a shell command from the rule params and logs its output.
struct ShellCommand;

#[async_trait]
impl JobHandler for ShellCommand {
    async fn run(&self, params: &serde_json::Value) -> Result<(), JobError> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::new("shell_command requires a 'command' param"))?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| JobError::new(format!("spawn failed: {e}")))?;

        if output.status.success() {
            info!(
                command,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "shell_command job finished"
            );
            Ok(())
        } else {
            Err(JobError::new(format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// The handlers every daemon process registers. Embedders building on
/// `unison-coord` directly register their own instead.
pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register("log_message", Arc::new(LogMessage));
    registry.register("shell_command", Arc::new(ShellCommand));
    registry
}
