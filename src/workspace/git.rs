//! Git worktree workspaces.
//!
//! Each task gets `<root>/<task_id>` checked out on branch
//! `<branch_prefix><task_id>`, created from `base_ref` the first time.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{WorkspaceInfo, WorkspaceProvider, WorkspaceStats, check_task_id, count_dirs, list_dirs};
use crate::error::WorkspaceError;

/// Default worktree root, relative to the repository.
pub const DEFAULT_ROOT: &str = ".tasksmith/worktrees";

/// Default branch prefix for task branches.
pub const DEFAULT_BRANCH_PREFIX: &str = "tasksmith/";

/// Hands out one git worktree per task.
pub struct GitWorktreeProvider {
    repo: PathBuf,
    root: PathBuf,
    branch_prefix: String,
    base_ref: String,
}

impl GitWorktreeProvider {
    /// Create a provider for the repository at `repo`.
    ///
    /// A relative `root` is resolved against the repository.
    pub fn new(repo: PathBuf, root: PathBuf) -> Self {
        let root = if root.is_absolute() { root } else { repo.join(root) };
        Self {
            repo,
            root,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            base_ref: "HEAD".to_string(),
        }
    }

    /// Builder: set the branch prefix.
    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    /// Builder: set the ref new branches start from.
    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = base_ref.into();
        self
    }

    /// Branch name used for a task.
    pub fn branch_for(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, task_id)
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    fn info(&self, task_id: &str) -> WorkspaceInfo {
        WorkspaceInfo {
            task_id: task_id.to_string(),
            path: self.path_for(task_id),
            branch: Some(self.branch_for(task_id)),
        }
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, WorkspaceError> {
        let status = Command::new("git")
            .arg("rev-parse")
            .arg("--verify")
            .arg("--quiet")
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    /// Run git in the repository, returning trimmed stdout.
    async fn git(&self, args: &[&str]) -> Result<String, WorkspaceError> {
        run_git(&self.repo, args).await
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorkspaceError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            reason: format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl WorkspaceProvider for GitWorktreeProvider {
    fn name(&self) -> &str {
        "git"
    }

    async fn create(&self, task_id: &str) -> Result<WorkspaceInfo, WorkspaceError> {
        check_task_id(task_id)?;
        let info = self.info(task_id);
        if tokio::fs::try_exists(&info.path).await? {
            debug!(task_id = %task_id, "Reusing existing worktree");
            return Ok(info);
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = info.path.to_string_lossy().to_string();
        let branch = self.branch_for(task_id);

        if self.branch_exists(&branch).await? {
            self.git(&["worktree", "add", &path, &branch]).await?;
        } else {
            self.git(&["worktree", "add", "-b", &branch, &path, &self.base_ref])
                .await?;
        }

        info!(task_id = %task_id, branch = %branch, path = %path, "Created worktree");
        Ok(info)
    }

    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        check_task_id(task_id)?;
        let info = self.info(task_id);
        if tokio::fs::try_exists(&info.path).await? {
            Ok(Some(info))
        } else {
            Ok(None)
        }
    }

    async fn remove(&self, task_id: &str, force: bool) -> Result<bool, WorkspaceError> {
        check_task_id(task_id)?;
        let path = self.path_for(task_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        let path = path.to_string_lossy().to_string();
        if force {
            self.git(&["worktree", "remove", "--force", &path]).await?;
        } else {
            self.git(&["worktree", "remove", &path]).await?;
        }
        debug!(task_id = %task_id, "Removed worktree");
        Ok(true)
    }

    async fn cleanup_all(&self, force: bool) -> Result<usize, WorkspaceError> {
        let mut removed = 0;
        for name in list_dirs(&self.root).await? {
            if check_task_id(&name).is_err() {
                continue;
            }
            match self.remove(&name, force).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                // Dirty worktrees refuse removal without force; keep going.
                Err(e) => warn!(task_id = %name, error = %e, "Failed to remove worktree"),
            }
        }
        self.git(&["worktree", "prune"]).await?;
        if removed > 0 {
            info!(removed, "Cleaned up worktrees");
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<WorkspaceStats, WorkspaceError> {
        Ok(WorkspaceStats {
            provider: self.name().to_string(),
            root: self.root.clone(),
            active: count_dirs(&self.root).await?,
        })
    }
}
