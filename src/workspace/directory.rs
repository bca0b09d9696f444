//! Plain-directory workspaces: `<root>/<task_id>/`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use super::{WorkspaceInfo, WorkspaceProvider, WorkspaceStats, check_task_id, count_dirs, list_dirs};
use crate::error::WorkspaceError;

/// Default workspace root under the project root.
pub const DEFAULT_ROOT: &str = ".tasksmith/workspaces";

/// Hands out one empty directory per task.
pub struct DirectoryWorkspaceProvider {
    root: PathBuf,
}

impl DirectoryWorkspaceProvider {
    /// Create a provider rooted at `root`. The directory is created lazily.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }
}

#[async_trait]
impl WorkspaceProvider for DirectoryWorkspaceProvider {
    fn name(&self) -> &str {
        "directory"
    }

    async fn create(&self, task_id: &str) -> Result<WorkspaceInfo, WorkspaceError> {
        check_task_id(task_id)?;
        let path = self.path_for(task_id);
        fs::create_dir_all(&path).await?;
        debug!(task_id = %task_id, path = %path.display(), "Workspace directory ready");
        Ok(WorkspaceInfo {
            task_id: task_id.to_string(),
            path,
            branch: None,
        })
    }

    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        check_task_id(task_id)?;
        let path = self.path_for(task_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(WorkspaceInfo {
            task_id: task_id.to_string(),
            path,
            branch: None,
        }))
    }

    async fn remove(&self, task_id: &str, _force: bool) -> Result<bool, WorkspaceError> {
        check_task_id(task_id)?;
        let path = self.path_for(task_id);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(task_id = %task_id, "Workspace directory removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_all(&self, force: bool) -> Result<usize, WorkspaceError> {
        let mut removed = 0;
        for name in list_dirs(&self.root).await? {
            if check_task_id(&name).is_err() {
                continue;
            }
            if self.remove(&name, force).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, root = %self.root.display(), "Cleaned up workspace directories");
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
