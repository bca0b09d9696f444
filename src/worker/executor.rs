//! Execution callbacks: what the pool runs for each admitted task.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ExecutionFault;
use crate::queue::{Task, TaskOutput};
use crate::worker::result::ExecutionResult;
use crate::workspace::WorkspaceInfo;

/// Maximum captured output kept in `TaskOutput.text` (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Log lines kept per execution (the tail).
const MAX_LOG_LINES: usize = 200;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Runs one task inside its workspace.
///
/// Implementations should report failures as an unsuccessful
/// [`ExecutionResult`]; an `Err` or a panic is also tolerated and recorded
/// as FAILED.
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceInfo,
    ) -> Result<ExecutionResult, ExecutionFault>;
}

/// Runs a shell command per task via `sh -c`.
///
/// The task is exposed to the command through `TASKSMITH_TASK_ID`,
/// `TASKSMITH_TASK_DESCRIPTION`, `TASKSMITH_TASK_PRIORITY` and
/// `TASKSMITH_WORKSPACE`. Exit status 0 is success.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
        }
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an extra environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn build_command(&self, task: &Task, workspace: &WorkspaceInfo) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&workspace.path)
            .env("TASKSMITH_TASK_ID", &task.id)
            .env("TASKSMITH_TASK_DESCRIPTION", &task.description)
            .env("TASKSMITH_TASK_PRIORITY", task.priority.to_string())
            .env("TASKSMITH_WORKSPACE", &workspace.path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(branch) = &workspace.branch {
            command.env("TASKSMITH_BRANCH", branch);
        }
        command
    }
}

#[async_trait]
impl ExecutionCallback for ShellExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceInfo,
    ) -> Result<ExecutionResult, ExecutionFault> {
        let child = self
            .build_command(task, workspace)
            .spawn()
            .map_err(|e| ExecutionFault::Callback(format!("Failed to spawn command: {e}")))?;

        debug!(task_id = %task.id, command = %self.command, "Spawned task command");

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutionFault::Callback(format!(
                    "Command execution failed: {e}"
                )));
            }
            Err(_) => {
                warn!(task_id = %task.id, timeout_secs = self.timeout.as_secs(), "Task command timed out");
                return Ok(ExecutionResult::failure(
                    &task.id,
                    format!("command timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        let task_output = TaskOutput {
            summary: Some(format!("exit code {code}")),
            text: Some(truncate_output(&combined)),
            logs: tail_lines(&stdout, &stderr),
            ..Default::default()
        };

        let result = if output.status.success() {
            ExecutionResult::success(&task.id)
        } else {
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| format!("exit code {code}: {}", l.trim()))
                .unwrap_or_else(|| format!("exit code {code}"));
            ExecutionResult::failure(&task.id, reason)
        };

        Ok(result.with_output(task_output))
    }
}

/// Last `MAX_LOG_LINES` lines of stdout followed by stderr.
fn tail_lines(stdout: &str, stderr: &str) -> Vec<String> {
    let lines: Vec<String> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    let skip = lines.len().saturating_sub(MAX_LOG_LINES);
    lines.into_iter().skip(skip).collect()
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        tail_start - head_end,
        &s[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
