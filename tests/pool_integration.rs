//! Integration tests for the worker pool against a real on-disk store.
//!
//! Each test opens a store in a temp directory, drives a pool with a stub
//! execution callback, and checks what the store shows afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::timeout;

use tasksmith::config::PoolConfig;
use tasksmith::error::{ExecutionFault, PoolError};
use tasksmith::queue::{NewTask, Priority, StatusUpdate, Task, TaskFilter, TaskStatus, TaskStore};
use tasksmith::worker::{
    EventHooks, ExecutionCallback, ExecutionResult, PoolEvent, PoolState, ShellExecutor,
    WorkerPool,
};
use tasksmith::workspace::{DirectoryWorkspaceProvider, WorkspaceInfo, WorkspacePolicy};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub callback: sleeps, then succeeds. Panics on the description "panic".
struct StubAgent {
    delay: Duration,
}

#[async_trait]
impl ExecutionCallback for StubAgent {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceInfo,
    ) -> Result<ExecutionResult, ExecutionFault> {
        assert!(workspace.path.is_dir());
        tokio::time::sleep(self.delay).await;
        if task.description == "panic" {
            panic!("agent crashed on {}", task.id);
        }
        Ok(ExecutionResult::success(&task.id).with_confidence(0.9))
    }
}

struct Harness {
    store: Arc<TaskStore>,
    pool: Arc<WorkerPool>,
    dir: TempDir,
}

async fn harness(executor: Arc<dyn ExecutionCallback>, max_concurrent: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
    let workspaces = Arc::new(DirectoryWorkspaceProvider::new(
        dir.path().join(".tasksmith/workspaces"),
    ));
    let config = PoolConfig {
        max_concurrent,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let pool = Arc::new(WorkerPool::new(store.clone(), workspaces, executor, config));
    Harness { store, pool, dir }
}

/// Counts executions, then succeeds after a delay.
struct CountingAgent {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecutionCallback for CountingAgent {
    async fn execute(
        &self,
        task: &Task,
        _workspace: &WorkspaceInfo,
    ) -> Result<ExecutionResult, ExecutionFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ExecutionResult::success(&task.id))
    }
}

fn stub(delay_ms: u64) -> Arc<dyn ExecutionCallback> {
    Arc::new(StubAgent {
        delay: Duration::from_millis(delay_ms),
    })
}

#[tokio::test]
async fn running_tasks_never_exceed_width() {
    let h = harness(stub(80), 2).await;
    for i in 0..6 {
        h.store.add(NewTask::new(format!("task {i}"))).await.unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let store = h.store.clone();
        let done = done.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let running = store.stats().await.unwrap().running;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let progress = timeout(TEST_TIMEOUT, h.pool.run(None))
        .await
        .expect("pool run timed out")
        .unwrap();
    done.store(true, Ordering::SeqCst);
    watcher.await.unwrap();

    assert_eq!(progress.completed, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn next_respects_dependencies_over_priority() {
    let h = harness(stub(0), 1).await;
    let readme = h
        .store
        .add(NewTask::new("Write README").with_priority(Priority::P1))
        .await
        .unwrap();
    let tests = h
        .store
        .add(
            NewTask::new("Add tests")
                .with_priority(Priority::P0)
                .depends_on(&readme.id),
        )
        .await
        .unwrap();

    assert_eq!(h.store.next().await.unwrap().unwrap().id, readme.id);
    h.store
        .update_status(&readme.id, TaskStatus::Complete, StatusUpdate::default())
        .await
        .unwrap();
    assert_eq!(h.store.next().await.unwrap().unwrap().id, tests.id);
}

#[tokio::test]
async fn max_tasks_leaves_the_rest_pending() {
    let h = harness(stub(10), 2).await;
    for i in 0..5 {
        h.store.add(NewTask::new(format!("task {i}"))).await.unwrap();
    }

    let progress = timeout(TEST_TIMEOUT, h.pool.run(Some(2)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(progress.total_tasks, 2);
    assert_eq!(progress.results.len(), 2);
    let pending = h
        .store
        .list(TaskFilter::status(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
}

#[tokio::test]
async fn stop_and_wait_leaves_nothing_running() {
    let h = harness(stub(200), 2).await;
    for i in 0..5 {
        h.store.add(NewTask::new(format!("task {i}"))).await.unwrap();
    }

    let handle = h.pool.start(None).unwrap();
    while h.pool.in_flight().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let in_flight = h.pool.in_flight();

    timeout(TEST_TIMEOUT, h.pool.stop(true)).await.unwrap();

    for id in &in_flight {
        let task = h.store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
    }
    assert_eq!(h.store.stats().await.unwrap().running, 0);
    assert_eq!(h.pool.state(), PoolState::Stopped);

    let progress = handle.await.unwrap().unwrap();
    assert_eq!(progress.completed, 2);
}

#[tokio::test]
async fn panicking_callback_marks_task_failed() {
    let h = harness(stub(0), 2).await;
    let doomed = h.store.add(NewTask::new("panic")).await.unwrap();
    let fine = h.store.add(NewTask::new("fine")).await.unwrap();

    let progress = timeout(TEST_TIMEOUT, h.pool.run(None))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(progress.failed, 1);
    assert_eq!(progress.completed, 1);
    assert!(!progress.is_success());

    let doomed = h.store.get(&doomed.id).await.unwrap();
    assert_eq!(doomed.status, TaskStatus::Failed);
    assert!(doomed.error.unwrap().contains("agent crashed"));
    assert!(doomed.completed_at.is_some());

    let fine = h.store.get(&fine.id).await.unwrap();
    assert_eq!(fine.status, TaskStatus::Complete);
    assert_eq!(fine.confidence, Some(0.9));
}

#[tokio::test]
async fn second_run_while_running_is_rejected() {
    let h = harness(stub(100), 1).await;
    h.store.add(NewTask::new("slow")).await.unwrap();

    let handle = h.pool.start(None).unwrap();
    assert!(matches!(h.pool.start(None), Err(PoolError::AlreadyRunning)));
    assert!(matches!(
        h.pool.run(None).await,
        Err(PoolError::AlreadyRunning)
    ));

    let progress = handle.await.unwrap().unwrap();
    assert_eq!(progress.completed, 1);
}

#[tokio::test]
async fn event_hooks_report_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
    let hooks = Arc::new(EventHooks::new());
    let mut events = hooks.subscribe();
    let pool = WorkerPool::new(
        store.clone(),
        Arc::new(DirectoryWorkspaceProvider::new(dir.path().join("ws"))),
        stub(0),
        PoolConfig::default(),
    )
    .with_hooks(hooks.clone());

    let task = store.add(NewTask::new("only task")).await.unwrap();
    pool.run(None).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 3);
    assert!(matches!(&seen[0], PoolEvent::TaskStarted { task_id, .. } if *task_id == task.id));
    assert!(matches!(
        &seen[1],
        PoolEvent::TaskCompleted { success: true, status: TaskStatus::Complete, .. }
    ));
    assert!(matches!(&seen[2], PoolEvent::Progress { completed: 1, .. }));
}

#[tokio::test]
async fn shell_executor_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
    let workspaces = Arc::new(DirectoryWorkspaceProvider::new(dir.path().join("ws")));
    let executor = Arc::new(ShellExecutor::new(
        "echo \"$TASKSMITH_TASK_DESCRIPTION\" > task.txt && test \"$TASKSMITH_TASK_PRIORITY\" = P0",
    ));
    let config = PoolConfig {
        workspace_policy: WorkspacePolicy::Keep,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let pool = WorkerPool::new(store.clone(), workspaces, executor, config);

    let urgent = store
        .add(NewTask::new("Fix login").with_priority(Priority::P0))
        .await
        .unwrap();
    let casual = store
        .add(NewTask::new("Tidy docs").with_priority(Priority::P3))
        .await
        .unwrap();

    let progress = timeout(TEST_TIMEOUT, pool.run(None)).await.unwrap().unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);

    let urgent = store.get(&urgent.id).await.unwrap();
    assert_eq!(urgent.status, TaskStatus::Complete);
    let written = std::fs::read_to_string(dir.path().join("ws").join(&urgent.id).join("task.txt"))
        .unwrap();
    assert_eq!(written.trim(), "Fix login");

    let casual = store.get(&casual.id).await.unwrap();
    assert_eq!(casual.status, TaskStatus::Failed);
    assert_eq!(casual.error.as_deref(), Some("exit code 1"));
    assert!(casual.output.is_some());
}

#[tokio::test]
async fn unresolved_dependency_is_never_dispatched() {
    let h = harness(stub(0), 2).await;
    let orphan = h
        .store
        .add(NewTask::new("Needs ghost").depends_on("ghost-task"))
        .await
        .unwrap();

    let report = h.store.dependency_report().await.unwrap();
    assert_eq!(
        report.unresolved,
        vec![(orphan.id.clone(), "ghost-task".to_string())]
    );

    let progress = timeout(TEST_TIMEOUT, h.pool.run(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.total_tasks, 0);
    assert_eq!(
        h.store.get(&orphan.id).await.unwrap().status,
        TaskStatus::Pending
    );
    drop(h.dir);
}

#[tokio::test]
async fn second_pool_leaves_a_live_task_alone() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor: Arc<dyn ExecutionCallback> = Arc::new(CountingAgent {
        delay: Duration::from_millis(300),
        calls: calls.clone(),
    });
    let first = harness(executor.clone(), 1).await;

    // A second process would open its own store over the same directory.
    let other_store = Arc::new(TaskStore::open(first.dir.path()).await.unwrap());
    let second = WorkerPool::new(
        other_store,
        Arc::new(DirectoryWorkspaceProvider::new(
            first.dir.path().join(".tasksmith/workspaces"),
        )),
        executor,
        PoolConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );

    let task = first.store.add(NewTask::new("only once")).await.unwrap();
    let handle = first.pool.start(None).unwrap();
    while first.pool.in_flight().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let progress = timeout(TEST_TIMEOUT, second.run(None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.total_tasks, 0);
    assert!(progress.is_success());
    assert_eq!(
        first.store.get(&task.id).await.unwrap().status,
        TaskStatus::Running
    );

    let progress = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let task = first.store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.iteration, 1);
    assert!(task.claimed_by.is_none());
}
