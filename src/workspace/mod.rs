//! Per-task isolated workspaces.
//!
//! A provider hands out one sandbox per task id and reclaims it afterwards:
//! - `directory`: a plain directory per task
//! - `git`: a git worktree per task on its own branch

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;

pub mod directory;
pub mod git;

pub use directory::DirectoryWorkspaceProvider;
pub use git::GitWorktreeProvider;

/// Location of one task's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub task_id: String,
    pub path: PathBuf,
    /// Branch checked out in the workspace, for VCS-backed providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Provider-level counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStats {
    pub provider: String,
    pub root: PathBuf,
    /// Workspaces currently present under the root.
    pub active: usize,
}

/// What to do with a workspace once its task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePolicy {
    /// Leave every workspace in place.
    Keep,
    /// Remove workspaces of successful tasks, keep failed ones for inspection.
    #[default]
    RemoveOnSuccess,
    /// Remove every workspace.
    Remove,
}

impl WorkspacePolicy {
    pub fn should_remove(self, success: bool) -> bool {
        match self {
            Self::Keep => false,
            Self::RemoveOnSuccess => success,
            Self::Remove => true,
        }
    }
}

impl std::str::FromStr for WorkspacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "remove_on_success" | "remove-on-success" => Ok(Self::RemoveOnSuccess),
            "remove" => Ok(Self::Remove),
            other => Err(format!(
                "unknown workspace policy '{other}' (expected keep, remove_on_success or remove)"
            )),
        }
    }
}

/// Creates and reclaims isolated execution contexts, one per task id.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Short provider name for logs and stats.
    fn name(&self) -> &str;

    /// Create (or reuse) the workspace for `task_id`.
    async fn create(&self, task_id: &str) -> Result<WorkspaceInfo, WorkspaceError>;

    /// Look up an existing workspace.
    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError>;

    /// Remove one workspace. Returns false if there was none.
    async fn remove(&self, task_id: &str, force: bool) -> Result<bool, WorkspaceError>;

    /// Remove every workspace this provider manages. Returns how many were removed.
    async fn cleanup_all(&self, force: bool) -> Result<usize, WorkspaceError>;

    async fn stats(&self) -> Result<WorkspaceStats, WorkspaceError>;
}

impl dyn WorkspaceProvider {
    /// Run `f` with the path of an existing workspace.
    pub async fn execute_in<F, Fut, R>(&self, task_id: &str, f: F) -> Result<R, WorkspaceError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let info = self
            .get(task_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound {
                task_id: task_id.to_string(),
            })?;
        Ok(f(info.path).await)
    }
}

/// Reject ids that would escape the workspace root.
pub(crate) fn check_task_id(task_id: &str) -> Result<(), WorkspaceError> {
    crate::queue::id::validate(task_id)
        .map_err(|_| WorkspaceError::InvalidTaskId(task_id.to_string()))
}

/// Count child directories of `root`; a missing root counts as empty.
pub(crate) async fn count_dirs(root: &Path) -> Result<usize, WorkspaceError> {
    Ok(list_dirs(root).await?.len())
}

/// Names of child directories of `root`, sorted.
pub(crate) async fn list_dirs(root: &Path) -> Result<Vec<String>, WorkspaceError> {
    if !tokio::fs::try_exists(root).await? {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let mut read_dir = tokio::fs::read_dir(root).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}
