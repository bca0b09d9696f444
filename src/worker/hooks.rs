//! Lifecycle hooks fired by the pool.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue::{Priority, Task, TaskStatus};
use crate::worker::result::{ExecutionProgress, ExecutionResult};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Observer of pool activity. Every method defaults to a no-op.
///
/// Hooks run inline on the worker of the task they describe and must not
/// block. A panicking hook is logged; the task and the pass carry on.
pub trait PoolHooks: Send + Sync {
    /// A task was marked RUNNING and its worker is about to execute it.
    fn on_task_start(&self, _task: &Task) {}

    /// A task finished, successfully or not.
    fn on_task_complete(&self, _result: &ExecutionResult) {}

    /// Pass counters changed after a completion.
    fn on_progress(&self, _progress: &ExecutionProgress) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PoolHooks for NoopHooks {}

/// Events published by [`EventHooks`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    TaskStarted {
        task_id: String,
        priority: Priority,
        iteration: u32,
    },
    TaskCompleted {
        task_id: String,
        success: bool,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Progress {
        total: usize,
        running: usize,
        completed: usize,
        failed: usize,
    },
}

/// Fans pool activity out to any number of subscribers.
pub struct EventHooks {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolHooks for EventHooks {
    fn on_task_start(&self, task: &Task) {
        self.publish(PoolEvent::TaskStarted {
            task_id: task.id.clone(),
            priority: task.priority,
            iteration: task.iteration,
        });
    }

    fn on_task_complete(&self, result: &ExecutionResult) {
        self.publish(PoolEvent::TaskCompleted {
            task_id: result.task_id.clone(),
            success: result.success,
            status: result.terminal_status(),
            error: result.error.clone(),
        });
    }

    fn on_progress(&self, progress: &ExecutionProgress) {
        self.publish(PoolEvent::Progress {
            total: progress.total_tasks,
            running: progress.running,
            completed: progress.completed,
            failed: progress.failed,
        });
    }
}
