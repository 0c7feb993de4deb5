//! Headless execution: running turns through the agent's one-shot CLI mode
//! instead of its interactive TUI.
//!
//! Sessions fall back to this path once the PTY restart budget is spent.

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::debug;

use super::turn::TurnRequest;

/// Executes one turn without a PTY. Implementations must be cheap to share;
/// the session spawns a task per request.
#[async_trait]
pub trait HeadlessExecutor: Send + Sync {
    async fn execute(&self, request: &TurnRequest) -> anyhow::Result<String>;
}

/// Runs the agent binary in non-interactive mode, message as the final
/// argument, reply read from stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl HeadlessExecutor for CommandExecutor {
    async fn execute(&self, request: &TurnRequest) -> anyhow::Result<String> {
        debug!(turn_id = %request.turn_id, program = %self.program, "headless execution");
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&request.message)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
