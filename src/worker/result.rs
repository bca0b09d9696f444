//! Execution outcomes and pass progress.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{QueueStats, StatusUpdate, TaskOutput, TaskStatus};
use crate::worker::state::PoolState;
use crate::workspace::WorkspaceStats;

/// Outcome of one execution attempt. Kept in memory; the store only sees
/// the terminal status and the fields folded into a [`StatusUpdate`].
///
/// The pool stamps `started_at`/`completed_at` and fills in the workspace
/// fields when the callback leaves them empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    /// Work succeeded but waits on an external merge.
    #[serde(default)]
    pub awaiting_merge: bool,
}

impl ExecutionResult {
    /// A successful result, timestamped now.
    pub fn success(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            success: true,
            workspace_path: None,
            branch: None,
            started_at: now,
            completed_at: now,
            error: None,
            confidence: None,
            output: None,
            pr_url: None,
            pr_number: None,
            awaiting_merge: false,
        }
    }

    /// A failed result carrying `error`.
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(task_id)
        }
    }

    pub fn with_output(mut self, output: TaskOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Builder: record an opened pull request; the task then awaits merge.
    pub fn with_pull_request(mut self, url: impl Into<String>, number: u64) -> Self {
        self.pr_url = Some(url.into());
        self.pr_number = Some(number);
        self.awaiting_merge = true;
        self
    }

    /// Wall-clock duration of the attempt.
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    /// Store status this result maps to.
    pub fn terminal_status(&self) -> TaskStatus {
        match (self.success, self.awaiting_merge) {
            (true, true) => TaskStatus::PendingMerge,
            (true, false) => TaskStatus::Complete,
            (false, _) => TaskStatus::Failed,
        }
    }

    /// Fields to persist alongside the terminal status.
    pub fn status_update(&self) -> StatusUpdate {
        StatusUpdate {
            workspace_path: self.workspace_path.clone(),
            branch: self.branch.clone(),
            pr_url: self.pr_url.clone(),
            pr_number: self.pr_number,
            confidence: self.confidence,
            error: self.error.clone(),
            output: self.output.clone(),
            claimed_by: None,
        }
    }
}

/// Counters for one pool pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    /// Tasks this pass intends to run.
    pub total_tasks: usize,
    /// Planned tasks not yet admitted.
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Store writes that failed during admission or completion.
    pub scheduling_failures: usize,
    pub results: Vec<ExecutionResult>,
}

impl ExecutionProgress {
    /// Fresh counters for a pass planning `total` tasks.
    pub fn planned(total: usize) -> Self {
        Self {
            total_tasks: total,
            pending: total,
            ..Default::default()
        }
    }

    pub(crate) fn admitted(&mut self) {
        if self.pending == 0 {
            // Admitted beyond the initial snapshot.
            self.total_tasks += 1;
        } else {
            self.pending -= 1;
        }
        self.running += 1;
    }

    pub(crate) fn admission_failed(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.scheduling_failures += 1;
    }

    pub(crate) fn finished(&mut self, result: ExecutionResult) {
        self.running = self.running.saturating_sub(1);
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    /// Attempts that have finished either way.
    pub fn done(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.scheduling_failures == 0
    }
}

/// Snapshot returned by [`WorkerPool::status`](super::WorkerPool::status).
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub max_concurrent: usize,
    pub progress: ExecutionProgress,
    /// Ids currently executing, sorted.
    pub in_flight: Vec<String>,
    pub workspaces: WorkspaceStats,
    pub queue: QueueStats,
}
