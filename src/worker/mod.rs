//! Worker system: bounded-concurrency task execution.
//!
//! Core components:
//! - `state`: Pool state machine (Idle → Running → Stopping → Stopped)
//! - `result`: ExecutionResult, ExecutionProgress, PoolStatus
//! - `executor`: ExecutionCallback trait and the shell-command callback
//! - `hooks`: PoolHooks trait, no-op and broadcast implementations
//! - `pool`: WorkerPool: admission loop, per-task workers, stop/drain

pub mod executor;
pub mod hooks;
pub mod pool;
pub mod result;
pub mod state;

pub use executor::{ExecutionCallback, ShellExecutor};
pub use hooks::{EventHooks, NoopHooks, PoolEvent, PoolHooks};
pub use pool::WorkerPool;
pub use result::{ExecutionProgress, ExecutionResult, PoolStatus};
pub use state::PoolState;
