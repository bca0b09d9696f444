//! Persistent, dependency-aware task queue.
//!
//! - `model`: Task records, status/priority enums, filters and stats
//! - `id`: id generation (slug + suffix) and validation
//! - `lease`: pass liveness leases guarding RUNNING tasks
//! - `ready`: ready-set computation and dependency diagnostics
//! - `store`: file-per-record store with atomic writes

pub mod id;
pub mod lease;
pub mod model;
pub mod ready;
pub mod store;

pub use model::{
    Artifact, ChangeKind, Metadata, NewTask, Priority, QueueStats, StatusUpdate, Task,
    TaskFilter, TaskOutput, TaskStatus,
};
pub use lease::Lease;
pub use ready::DependencyReport;
pub use store::TaskStore;
