//! Task data model: records, enums, and the string mapping used on disk.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Free-form metadata attached to a task.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Task urgency. Lower is more urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
    P4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [Self::P0, Self::P1, Self::P2, Self::P3, Self::P4];

    /// Numeric rank (0 = most urgent).
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.rank())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits
            .strip_prefix('P')
            .or_else(|| digits.strip_prefix('p'))
            .unwrap_or(digits);
        match digits {
            "0" => Ok(Self::P0),
            "1" => Ok(Self::P1),
            "2" => Ok(Self::P2),
            "3" => Ok(Self::P3),
            "4" => Ok(Self::P4),
            _ => Err(QueueError::validation(format!("unknown priority '{s}'"))),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies or approval.
    Pending,
    /// Explicitly approved for dispatch.
    Ready,
    /// Dispatched to a worker.
    Running,
    /// Work succeeded, change awaits merge.
    PendingMerge,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Ready,
        Self::Running,
        Self::PendingMerge,
        Self::Complete,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Check if a task in this state may be dispatched (dependencies aside).
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// Terminal states are never left or rewritten; every other move is allowed.
    pub fn can_transition_to(&self, _target: TaskStatus) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::PendingMerge => "pending_merge",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| QueueError::validation(format!("unknown status '{s}'")))
    }
}

/// How a file changed during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// A file touched by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the workspace root.
    pub path: String,
    pub change: ChangeKind,
    /// Inline file content, when small enough to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Output record attached to a task when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Execution log lines.
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_calls: u64,
}

impl TaskOutput {
    /// Builder: set summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Builder: add a log line.
    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    /// Builder: add an artifact.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable id (slug of the description plus a suffix).
    pub id: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ids of tasks that must be COMPLETE before this one is ready.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Number of times the task entered RUNNING.
    #[serde(default)]
    pub iteration: u32,
    /// Lease owner of the pass executing this task; set only while RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Ordering key used by every listing: priority, then age, then id.
    pub(crate) fn queue_key(&self) -> (Priority, DateTime<Utc>, &str) {
        (self.priority, self.created_at, self.id.as_str())
    }
}

/// Input to [`TaskStore::add`](super::TaskStore::add).
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub priority: Priority,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub metadata: Metadata,
    /// Explicit id; generated from the description when absent.
    pub id: Option<String>,
}

impl NewTask {
    /// Create a new task request with default priority.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add an acceptance criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    /// Builder: add a dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Builder: set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builder: use an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Optional fields recorded alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub workspace_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
    pub output: Option<TaskOutput>,
    /// Lease owner claiming a RUNNING task. Ignored for other statuses.
    pub claimed_by: Option<String>,
}

impl StatusUpdate {
    /// Builder: claim the task for a lease owner.
    pub fn claimed_by(mut self, owner: impl Into<String>) -> Self {
        self.claimed_by = Some(owner.into());
        self
    }

    /// Builder: set error text.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Builder: set workspace location.
    pub fn with_workspace(mut self, path: impl Into<PathBuf>, branch: Option<String>) -> Self {
        self.workspace_path = Some(path.into());
        self.branch = branch;
        self
    }
}

/// Listing filter for [`TaskStore::list`](super::TaskStore::list).
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub include_terminal: bool,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            include_terminal: true,
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(priority) = self.priority
            && task.priority != priority
        {
            return false;
        }
        let terminal_requested =
            self.include_terminal || self.status.is_some_and(|s| s.is_terminal());
        terminal_requested || !task.is_terminal()
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub pending_merge: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::PendingMerge => self.pending_merge += 1,
            TaskStatus::Complete => self.complete += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Ready => self.ready,
            TaskStatus::Running => self.running,
            TaskStatus::PendingMerge => self.pending_merge,
            TaskStatus::Complete => self.complete,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }
}
