//! Configuration types.
//!
//! Every setting has a default; `Config::from_env` overrides them from
//! `TASKSMITH_*` environment variables.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workspace::{
    DirectoryWorkspaceProvider, GitWorktreeProvider, WorkspacePolicy, WorkspaceProvider,
    directory, git,
};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum tasks executing at once.
    pub max_concurrent: usize,
    /// Coordinator wake-up interval when nothing completes.
    pub poll_interval: Duration,
    /// What happens to a workspace once its task finishes.
    pub workspace_policy: WorkspacePolicy,
    /// Reset RUNNING tasks whose claiming pass holds no live lease to PENDING
    /// at pass start.
    pub recover_stale: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_secs(1),
            workspace_policy: WorkspacePolicy::default(),
            recover_stale: true,
        }
    }
}

/// Which workspace provider to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkspaceKind {
    #[default]
    Directory,
    Git,
}

impl FromStr for WorkspaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "directory" | "dir" => Ok(Self::Directory),
            "git" | "worktree" => Ok(Self::Git),
            other => Err(format!("unknown workspace kind '{other}' (expected directory or git)")),
        }
    }
}

/// Workspace provider configuration.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub kind: WorkspaceKind,
    /// Branch prefix for git worktrees.
    pub branch_prefix: String,
    /// Ref new git branches start from.
    pub base_ref: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            kind: WorkspaceKind::default(),
            branch_prefix: git::DEFAULT_BRANCH_PREFIX.to_string(),
            base_ref: "HEAD".to_string(),
        }
    }
}

impl WorkspaceConfig {
    /// Build the configured provider for a project.
    pub fn provider(&self, project_root: &Path) -> Arc<dyn WorkspaceProvider> {
        match self.kind {
            WorkspaceKind::Directory => Arc::new(DirectoryWorkspaceProvider::new(
                project_root.join(directory::DEFAULT_ROOT),
            )),
            WorkspaceKind::Git => Arc::new(
                GitWorktreeProvider::new(project_root.to_path_buf(), PathBuf::from(git::DEFAULT_ROOT))
                    .with_branch_prefix(&self.branch_prefix)
                    .with_base_ref(&self.base_ref),
            ),
        }
    }
}

/// Shell execution configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Command run per task; the binary requires it.
    pub command: Option<String>,
    pub timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub pool: PoolConfig,
    pub workspace: WorkspaceConfig,
    pub exec: ExecConfig,
    /// Admission cap for one pass.
    pub max_tasks: Option<usize>,
    /// Directory for daily-rolling log files; stdout when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            pool: PoolConfig::default(),
            workspace: WorkspaceConfig::default(),
            exec: ExecConfig::default(),
            max_tasks: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Build config from `TASKSMITH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pool = PoolConfig {
            max_concurrent: parse_or(&var, "TASKSMITH_MAX_CONCURRENT", defaults.pool.max_concurrent)?,
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "TASKSMITH_POLL_INTERVAL_MS",
                defaults.pool.poll_interval.as_millis() as u64,
            )?),
            workspace_policy: parse_or(
                &var,
                "TASKSMITH_WORKSPACE_POLICY",
                defaults.pool.workspace_policy,
            )?,
            recover_stale: parse_bool_or(&var, "TASKSMITH_RECOVER_STALE", defaults.pool.recover_stale)?,
        };
        if pool.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKSMITH_MAX_CONCURRENT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let workspace = WorkspaceConfig {
            kind: parse_or(&var, "TASKSMITH_WORKSPACE_KIND", defaults.workspace.kind)?,
            branch_prefix: var("TASKSMITH_BRANCH_PREFIX").unwrap_or(defaults.workspace.branch_prefix),
            base_ref: var("TASKSMITH_BASE_REF").unwrap_or(defaults.workspace.base_ref),
        };

        let exec = ExecConfig {
            command: var("TASKSMITH_EXEC_CMD"),
            timeout: Duration::from_secs(parse_or(
                &var,
                "TASKSMITH_EXEC_TIMEOUT_SECS",
                defaults.exec.timeout.as_secs(),
            )?),
        };

        let max_tasks = match var("TASKSMITH_MAX_TASKS") {
            Some(raw) => Some(parse_value("TASKSMITH_MAX_TASKS", &raw)?),
            None => None,
        };

        Ok(Self {
            project_root: var("TASKSMITH_PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.project_root),
            pool,
            workspace,
            exec,
            max_tasks,
            log_dir: var("TASKSMITH_LOG_DIR").map(PathBuf::from),
        })
    }

    /// The execution command, required to run tasks from the binary.
    pub fn require_command(&self) -> Result<&str, ConfigError> {
        self.exec
            .command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("TASKSMITH_EXEC_CMD".to_string()))
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(var: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = var(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{raw}'"),
        }),
    }
}
