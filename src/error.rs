//! Error types for tasksmith.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task queue (record store) errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid task: {reason}")]
    Validation { reason: String },

    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed task record {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl QueueError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Workspace provider errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Invalid task id for workspace: {0}")]
    InvalidTaskId(String),

    #[error("No workspace for task {task_id}")]
    NotFound { task_id: String },

    #[error("`{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fault raised while executing a single task.
///
/// Faults never escape the pool: each one is downgraded to a FAILED result.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionFault {
    #[error("{0}")]
    Callback(String),

    #[error("execution panicked: {0}")]
    Panicked(String),

    #[error("workspace unavailable: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Result type alias for tasksmith.
pub type Result<T> = std::result::Result<T, Error>;
