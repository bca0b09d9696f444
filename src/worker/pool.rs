//! Bounded-concurrency worker pool.
//!
//! One coordinator (the future driving [`WorkerPool::run`]) recomputes the
//! ready set on every tick and admits tasks into a `JoinSet` while slots are
//! free. Each worker acquires its workspace, invokes the execution callback,
//! persists the terminal status and reconciles the workspace. The coordinator
//! wakes on the poll interval, on a worker completion or on a stop request.
//!
//! Every pass holds a lease in the store and claims the tasks it admits, so a
//! second pool on the same store never recovers a task that is still running.

use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{RwLock, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{ExecutionFault, PoolError, QueueError};
use crate::queue::lease::{self, LEASE_REFRESH};
use crate::queue::{StatusUpdate, Task, TaskStatus, TaskStore};
use crate::worker::executor::ExecutionCallback;
use crate::worker::hooks::{NoopHooks, PoolHooks};
use crate::worker::result::{ExecutionProgress, ExecutionResult, PoolStatus};
use crate::worker::state::PoolState;
use crate::workspace::{WorkspaceInfo, WorkspacePolicy, WorkspaceProvider};

type InFlight = Arc<Mutex<BTreeSet<String>>>;

/// Everything a worker needs, cloned into each spawned task.
#[derive(Clone)]
struct WorkerDeps {
    store: Arc<TaskStore>,
    workspaces: Arc<dyn WorkspaceProvider>,
    executor: Arc<dyn ExecutionCallback>,
    hooks: Arc<dyn PoolHooks>,
    progress: Arc<RwLock<ExecutionProgress>>,
    policy: WorkspacePolicy,
}

/// Dispatches ready tasks to an execution callback, at most
/// `max_concurrent` at a time.
pub struct WorkerPool {
    deps: WorkerDeps,
    config: PoolConfig,
    max_concurrent: AtomicUsize,
    state: watch::Sender<PoolState>,
    in_flight: InFlight,
}

impl WorkerPool {
    pub fn new(
        store: Arc<TaskStore>,
        workspaces: Arc<dyn WorkspaceProvider>,
        executor: Arc<dyn ExecutionCallback>,
        config: PoolConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(PoolState::Idle);
        Self {
            deps: WorkerDeps {
                store,
                workspaces,
                executor,
                hooks: Arc::new(NoopHooks),
                progress: Arc::new(RwLock::new(ExecutionProgress::default())),
                policy: config.workspace_policy,
            },
            max_concurrent: AtomicUsize::new(config.max_concurrent.max(1)),
            config,
            state,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Builder: install lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn PoolHooks>) -> Self {
        self.deps.hooks = hooks;
        self
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Change the pool width. Takes effect on the next admission tick;
    /// values below 1 are clamped to 1.
    pub fn set_max_concurrent(&self, n: usize) {
        let n = n.max(1);
        self.max_concurrent.store(n, Ordering::SeqCst);
        info!(max_concurrent = n, "Pool width changed");
    }

    /// Ids of tasks currently executing, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        lock(&self.in_flight).iter().cloned().collect()
    }

    /// Run one pass to completion and return its progress.
    ///
    /// Fails only if the pool is already running or the pass cannot be
    /// planned; once admission starts every outcome lands in the progress.
    pub async fn run(&self, max_tasks: Option<usize>) -> Result<ExecutionProgress, PoolError> {
        self.begin()?;
        self.run_pass(max_tasks).await
    }

    /// Start a pass on a spawned tokio task.
    pub fn start(
        self: &Arc<Self>,
        max_tasks: Option<usize>,
    ) -> Result<JoinHandle<Result<ExecutionProgress, PoolError>>, PoolError> {
        self.begin()?;
        let pool = Arc::clone(self);
        Ok(tokio::spawn(async move { pool.run_pass(max_tasks).await }))
    }

    /// Stop admitting new tasks. With `wait`, return only once in-flight
    /// work has drained. A no-op when no pass is active.
    pub async fn stop(&self, wait: bool) {
        let requested = self.state.send_if_modified(|state| {
            if *state == PoolState::Running {
                *state = PoolState::Stopping;
                true
            } else {
                false
            }
        });
        if requested {
            info!(in_flight = lock(&self.in_flight).len(), "Pool stop requested");
        }

        if wait {
            let mut rx = self.state.subscribe();
            // The sender lives in `self`, so this only ends on a state change.
            let _ = rx.wait_for(|state| !state.is_active()).await;
        }
    }

    /// Snapshot of pool, workspace and queue state.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        Ok(PoolStatus {
            state: self.state(),
            max_concurrent: self.max_concurrent(),
            progress: self.deps.progress.read().await.clone(),
            in_flight: self.in_flight(),
            workspaces: self.deps.workspaces.stats().await?,
            queue: self.deps.store.stats().await?,
        })
    }

    /// Remove every workspace the provider manages.
    ///
    /// Refused while a pass is active or tasks are still in flight, since
    /// those tasks own their workspaces.
    pub async fn cleanup(&self, force: bool) -> Result<usize, PoolError> {
        if self.state().is_active() || !lock(&self.in_flight).is_empty() {
            return Err(PoolError::AlreadyRunning);
        }
        let removed = self.deps.workspaces.cleanup_all(force).await?;
        info!(removed, force, "Workspaces cleaned up");
        Ok(removed)
    }

    /// Enter RUNNING, or fail if a pass is already active.
    fn begin(&self) -> Result<(), PoolError> {
        let started = self.state.send_if_modified(|state| {
            if state.can_transition_to(PoolState::Running) {
                *state = PoolState::Running;
                true
            } else {
                false
            }
        });
        if started {
            Ok(())
        } else {
            Err(PoolError::AlreadyRunning)
        }
    }

    async fn run_pass(&self, max_tasks: Option<usize>) -> Result<ExecutionProgress, PoolError> {
        let mut pass = PassGuard {
            state: &self.state,
            workers: JoinSet::new(),
        };
        let owner = lease::owner_id();

        let total = match self.plan(&owner, max_tasks).await {
            Ok(total) => total,
            Err(e) => {
                error!(error = %e, "Failed to plan pool pass");
                let _ = self.deps.store.release_lease(&owner).await;
                return Err(e);
            }
        };
        *self.deps.progress.write().await = ExecutionProgress::planned(total);
        let heartbeat = self.spawn_heartbeat(owner.clone());

        info!(
            total,
            owner = %owner,
            max_concurrent = self.max_concurrent(),
            max_tasks = ?max_tasks,
            "Pool pass started"
        );

        let mut state_rx = self.state.subscribe();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut admitted = 0usize;

        loop {
            if *state_rx.borrow_and_update() == PoolState::Stopping {
                info!("Stop requested, no longer admitting tasks");
                break;
            }

            while let Some(joined) = pass.workers.try_join_next() {
                reap(joined);
            }

            let dispatched = self
                .dispatch(&owner, &mut pass.workers, &mut attempted, &mut admitted, max_tasks)
                .await;

            if pass.workers.is_empty() {
                debug!("Nothing ready and nothing in flight");
                break;
            }

            if dispatched == 0 {
                tokio::select! {
                    _ = state_rx.changed() => {}
                    Some(joined) = pass.workers.join_next() => reap(joined),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        if !pass.workers.is_empty() {
            info!(count = pass.workers.len(), "Waiting for in-flight tasks to complete");
            while let Some(joined) = pass.workers.join_next().await {
                reap(joined);
            }
        }

        heartbeat.abort();
        if let Err(e) = self.deps.store.release_lease(&owner).await {
            warn!(owner = %owner, error = %e, "Failed to release pass lease");
        }

        let progress = self.deps.progress.read().await.clone();
        drop(pass);
        info!(
            total = progress.total_tasks,
            completed = progress.completed,
            failed = progress.failed,
            scheduling_failures = progress.scheduling_failures,
            "Pool pass finished"
        );
        Ok(progress)
    }

    /// Take the pass lease, recover stale tasks, report dependency problems
    /// and size the pass.
    async fn plan(&self, owner: &str, max_tasks: Option<usize>) -> Result<usize, PoolError> {
        let store = &self.deps.store;
        store.refresh_lease(owner).await?;

        if self.config.recover_stale {
            let recovered = store.recover_stale(&self.in_flight()).await?;
            if !recovered.is_empty() {
                info!(count = recovered.len(), "Recovered stale running tasks");
            }
        }

        let report = store.dependency_report().await?;
        for (task_id, dependency) in &report.unresolved {
            warn!(task_id = %task_id, dependency = %dependency, "Task depends on an unknown task and will never be ready");
        }
        for cycle in &report.cycles {
            warn!(cycle = %cycle.join(" -> "), "Dependency cycle; these tasks will never be ready");
        }

        let ready = store.ready().await?.len();
        Ok(max_tasks.map_or(ready, |max| ready.min(max)))
    }

    /// Keep the pass lease fresh. The pass aborts this when it ends normally.
    /// A dropped pass leaves it running until its detached workers finish.
    fn spawn_heartbeat(&self, owner: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.deps.store);
        let in_flight = Arc::clone(&self.in_flight);
        let state = self.state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_REFRESH).await;
                let active = state.borrow().is_active();
                let drained = lock(&in_flight).is_empty();
                if !active && drained {
                    break;
                }
                if let Err(e) = store.refresh_lease(&owner).await {
                    warn!(owner = %owner, error = %e, "Failed to refresh pass lease");
                }
            }
            if let Err(e) = store.release_lease(&owner).await {
                warn!(owner = %owner, error = %e, "Failed to release pass lease");
            }
        })
    }

    /// Admit ready tasks into free slots. Returns how many were spawned.
    async fn dispatch(
        &self,
        owner: &str,
        join_set: &mut JoinSet<()>,
        attempted: &mut HashSet<String>,
        admitted: &mut usize,
        max_tasks: Option<usize>,
    ) -> usize {
        let free = self.max_concurrent().saturating_sub(join_set.len());
        if free == 0 || max_tasks.is_some_and(|max| *admitted >= max) {
            return 0;
        }

        let ready = match self.deps.store.ready().await {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Failed to compute ready tasks");
                self.deps.progress.write().await.scheduling_failures += 1;
                return 0;
            }
        };

        let mut dispatched = 0;
        for task in ready {
            if dispatched >= free || max_tasks.is_some_and(|max| *admitted >= max) {
                break;
            }
            if *self.state.borrow() == PoolState::Stopping {
                break;
            }
            if attempted.contains(&task.id) || lock(&self.in_flight).contains(&task.id) {
                continue;
            }
            attempted.insert(task.id.clone());

            let task = match self.deps.store.claim(&task.id, owner).await {
                Ok(task) => task,
                Err(QueueError::InvalidTransition { from, .. }) => {
                    debug!(task_id = %task.id, status = %from, "Task taken before it could be claimed");
                    continue;
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to mark task running");
                    self.deps.progress.write().await.admission_failed();
                    continue;
                }
            };

            *admitted += 1;
            self.deps.progress.write().await.admitted();
            info!(task_id = %task.id, priority = %task.priority, iteration = task.iteration, "Task admitted");

            let guard = InFlightGuard::insert(&self.in_flight, &task.id);
            let deps = self.deps.clone();
            join_set.spawn(async move {
                let _guard = guard;
                deps.execute(task).await;
            });
            dispatched += 1;
        }
        dispatched
    }
}

impl WorkerDeps {
    /// Execute one admitted task end to end.
    async fn execute(&self, task: Task) {
        call_hook(&task.id, "on_task_start", || self.hooks.on_task_start(&task));
        let started_at = Utc::now();
        let (workspace, mut result) = self.attempt(&task).await;

        result.task_id = task.id.clone();
        result.started_at = started_at;
        result.completed_at = Utc::now();
        if let Some(ws) = &workspace {
            if result.workspace_path.is_none() {
                result.workspace_path = Some(ws.path.clone());
            }
            if result.branch.is_none() {
                result.branch = ws.branch.clone();
            }
        }

        let status = result.terminal_status();
        let persisted = self
            .store
            .update_status(&task.id, status, result.status_update())
            .await;

        let progress = {
            let mut progress = self.progress.write().await;
            if let Err(e) = &persisted {
                error!(task_id = %task.id, status = %status, error = %e, "Failed to persist task completion");
                progress.scheduling_failures += 1;
            }
            progress.finished(result.clone());
            progress.clone()
        };

        if result.success {
            info!(
                task_id = %task.id,
                status = %status,
                duration_ms = result.duration().num_milliseconds(),
                "Task completed"
            );
        } else {
            warn!(
                task_id = %task.id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Task failed"
            );
        }

        if workspace.is_some() && self.policy.should_remove(result.success) {
            match self.workspaces.remove(&task.id, true).await {
                Ok(_) => debug!(task_id = %task.id, "Workspace reclaimed"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to remove workspace"),
            }
        }

        call_hook(&task.id, "on_task_complete", || {
            self.hooks.on_task_complete(&result)
        });
        call_hook(&task.id, "on_progress", || self.hooks.on_progress(&progress));
    }

    /// Acquire the workspace and run the callback. Every fault becomes a
    /// failed result.
    async fn attempt(&self, task: &Task) -> (Option<WorkspaceInfo>, ExecutionResult) {
        let workspace = match self.workspaces.create(&task.id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let fault = ExecutionFault::from(e);
                return (None, ExecutionResult::failure(&task.id, fault.to_string()));
            }
        };

        let update = StatusUpdate::default().with_workspace(&workspace.path, workspace.branch.clone());
        if let Err(e) = self
            .store
            .update_status(&task.id, TaskStatus::Running, update)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to record workspace on task");
        }

        let outcome = AssertUnwindSafe(self.executor.execute(task, &workspace))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(fault)) => ExecutionResult::failure(&task.id, fault.to_string()),
            Err(payload) => {
                let fault = ExecutionFault::Panicked(panic_message(&*payload));
                error!(task_id = %task.id, error = %fault, "Execution callback panicked");
                ExecutionResult::failure(&task.id, fault.to_string())
            }
        };
        (Some(workspace), result)
    }
}

/// Owns the workers of one pass and leaves the pool STOPPED when dropped.
///
/// If the pass future is dropped early its workers are detached rather than
/// aborted, so each still persists its task's outcome.
struct PassGuard<'a> {
    state: &'a watch::Sender<PoolState>,
    workers: JoinSet<()>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!(count = self.workers.len(), "Pool pass dropped with tasks in flight, detaching workers");
            self.workers.detach_all();
        }
        self.state.send_modify(|state| *state = PoolState::Stopped);
    }
}

/// Marks a task id in flight for as long as the guard lives.
struct InFlightGuard {
    set: InFlight,
    task_id: String,
}

impl InFlightGuard {
    fn insert(set: &InFlight, task_id: &str) -> Self {
        lock(set).insert(task_id.to_string());
        Self {
            set: Arc::clone(set),
            task_id: task_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.task_id);
    }
}

fn lock(set: &InFlight) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a caller hook. A panic inside it is logged and goes no further.
fn call_hook(task_id: &str, hook: &'static str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(task_id = %task_id, hook, error = %panic_message(&*payload), "Pool hook panicked");
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Worker task panicked outside the execution callback");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
