//! File-backed task store.
//!
//! Each task lives in its own pretty-printed JSON file at
//! `<project_root>/.tasksmith/tasks/<id>.json`. Every write goes to a hidden
//! temp file in the same directory and is renamed into place, so a reader
//! sees either the previous record or the new one, never a torn write.
//! Pass leases live next to the records under `.tasksmith/leases`.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::id;
use super::lease::{LEASE_TTL, LEASES_DIR, Lease};
use super::model::{NewTask, QueueStats, StatusUpdate, Task, TaskFilter, TaskStatus};
use super::ready::{self, DependencyReport};
use crate::error::QueueError;

/// Directory under the project root holding task records.
pub const TASKS_DIR: &str = ".tasksmith/tasks";

/// Extension of task record files.
pub const RECORD_EXTENSION: &str = "json";

/// Attempts at deriving a fresh generated id before giving up.
const MAX_ID_ATTEMPTS: u32 = 16;

/// Durable task queue, one record file per task.
pub struct TaskStore {
    dir: PathBuf,
    leases_dir: PathBuf,
    /// Serializes `add` so the exists-check and the write are atomic in-process.
    add_lock: Mutex<()>,
    /// Serializes `claim` so two pools sharing this store never both win a task.
    claim_lock: Mutex<()>,
}

impl TaskStore {
    /// Open (creating if needed) the store under `project_root`.
    pub async fn open(project_root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = project_root.as_ref().join(TASKS_DIR);
        let leases_dir = project_root.as_ref().join(LEASES_DIR);
        for path in [&dir, &leases_dir] {
            fs::create_dir_all(path)
                .await
                .map_err(|e| QueueError::io(path, e))?;
        }
        debug!(dir = %dir.display(), "Opened task store");
        Ok(Self {
            dir,
            leases_dir,
            add_lock: Mutex::new(()),
            claim_lock: Mutex::new(()),
        })
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    /// Add a new task. Never overwrites an existing record.
    pub async fn add(&self, request: NewTask) -> Result<Task, QueueError> {
        let description = request.description.trim();
        if description.is_empty() {
            return Err(QueueError::validation("description must not be empty"));
        }

        let _guard = self.add_lock.lock().await;
        let now = Utc::now();

        let id = match request.id {
            Some(explicit) => {
                id::validate(&explicit)?;
                if self.exists(&explicit).await? {
                    return Err(QueueError::validation(format!(
                        "task id '{explicit}' already exists"
                    )));
                }
                explicit
            }
            None => self.fresh_id(description, now).await?,
        };

        if request.dependencies.contains(&id) {
            return Err(QueueError::validation(format!(
                "task '{id}' cannot depend on itself"
            )));
        }

        let task = Task {
            id,
            description: description.to_string(),
            priority: request.priority,
            status: TaskStatus::Pending,
            acceptance_criteria: request.acceptance_criteria,
            dependencies: request.dependencies,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            workspace_path: None,
            branch: None,
            pr_url: None,
            pr_number: None,
            confidence: None,
            error: None,
            output: None,
            metadata: request.metadata,
            iteration: 0,
            claimed_by: None,
        };

        self.write(&task).await?;
        info!(task_id = %task.id, priority = %task.priority, "Task added");
        Ok(task)
    }

    async fn fresh_id(
        &self,
        description: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, QueueError> {
        for attempt in 0..MAX_ID_ATTEMPTS {
            let candidate = id::generate(description, now, attempt);
            if !self.exists(&candidate).await? {
                return Ok(candidate);
            }
            debug!(candidate = %candidate, attempt, "Generated task id collided");
        }
        Err(QueueError::validation(format!(
            "could not derive a unique id for '{description}'"
        )))
    }

    async fn exists(&self, id: &str) -> Result<bool, QueueError> {
        let path = self.record_path(id);
        fs::try_exists(&path)
            .await
            .map_err(|e| QueueError::io(path, e))
    }

    /// Get a task by id.
    pub async fn get(&self, id: &str) -> Result<Task, QueueError> {
        if id::validate(id).is_err() {
            return Err(QueueError::NotFound { id: id.to_string() });
        }
        let path = self.record_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QueueError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(QueueError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| QueueError::Serialization { path, source })
    }

    /// List tasks matching `filter`, most urgent first.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
        let mut tasks: Vec<Task> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
        Ok(tasks)
    }

    /// Every dispatchable task whose dependencies are all COMPLETE, most urgent first.
    pub async fn ready(&self) -> Result<Vec<Task>, QueueError> {
        Ok(ready::ready_tasks(&self.load_all().await?))
    }

    /// The most urgent ready task, if any.
    pub async fn next(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.ready().await?.into_iter().next())
    }

    /// Change a task's status and record the optional fields in `update`.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<Task, QueueError> {
        let mut task = self.get(id).await?;

        if !task.status.can_transition_to(status) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        let previous = task.status;
        task.status = status;
        task.updated_at = now;

        if status == TaskStatus::Running && previous != TaskStatus::Running {
            task.started_at = Some(now);
            task.iteration += 1;
        }
        if status.is_terminal() && !previous.is_terminal() {
            task.completed_at = Some(now);
        }

        let StatusUpdate {
            workspace_path,
            branch,
            pr_url,
            pr_number,
            confidence,
            error,
            output,
            claimed_by,
        } = update;
        if status == TaskStatus::Running {
            if claimed_by.is_some() {
                task.claimed_by = claimed_by;
            }
        } else {
            task.claimed_by = None;
        }
        if workspace_path.is_some() {
            task.workspace_path = workspace_path;
        }
        if branch.is_some() {
            task.branch = branch;
        }
        if pr_url.is_some() {
            task.pr_url = pr_url;
        }
        if pr_number.is_some() {
            task.pr_number = pr_number;
        }
        if confidence.is_some() {
            task.confidence = confidence;
        }
        if error.is_some() {
            task.error = error;
        }
        if output.is_some() {
            task.output = output;
        }

        self.write(&task).await?;
        debug!(task_id = %id, from = %previous, to = %status, "Task status updated");
        Ok(task)
    }

    /// Move a PENDING or READY task to RUNNING on behalf of `owner`.
    ///
    /// Fails with `InvalidTransition` when the task is no longer dispatchable,
    /// which is how a pool learns another one admitted it first.
    pub async fn claim(&self, id: &str, owner: &str) -> Result<Task, QueueError> {
        let _guard = self.claim_lock.lock().await;
        let task = self.get(id).await?;
        if !task.status.is_dispatchable() {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        self.update_status(id, TaskStatus::Running, StatusUpdate::default().claimed_by(owner))
            .await
    }

    /// Cancel a non-terminal task.
    pub async fn cancel(&self, id: &str, reason: Option<&str>) -> Result<Task, QueueError> {
        let update = StatusUpdate {
            error: reason.map(str::to_string),
            ..Default::default()
        };
        self.update_status(id, TaskStatus::Cancelled, update).await
    }

    /// Delete a task record. Returns false if it did not exist.
    pub async fn remove(&self, id: &str) -> Result<bool, QueueError> {
        if id::validate(id).is_err() {
            return Ok(false);
        }
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(task_id = %id, "Task removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(QueueError::io(path, e)),
        }
    }

    /// Delete every task, sparing RUNNING ones unless `include_running`.
    pub async fn clear(&self, include_running: bool) -> Result<usize, QueueError> {
        let mut removed = 0;
        for task in self.load_all().await? {
            if task.status == TaskStatus::Running && !include_running {
                continue;
            }
            if self.remove(&task.id).await? {
                removed += 1;
            }
        }
        info!(removed, include_running, "Task store cleared");
        Ok(removed)
    }

    /// Task counts per status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for task in self.load_all().await? {
            stats.record(task.status);
        }
        Ok(stats)
    }

    /// Unresolved dependencies and cycles among non-terminal tasks.
    pub async fn dependency_report(&self) -> Result<DependencyReport, QueueError> {
        Ok(ready::dependency_report(&self.load_all().await?))
    }

    /// Reset RUNNING tasks whose pass is gone back to PENDING.
    ///
    /// A task is left alone while its id is in `in_flight` or the owner that
    /// claimed it still holds a fresh lease.
    pub async fn recover_stale(&self, in_flight: &[String]) -> Result<Vec<String>, QueueError> {
        let live = self.live_owners().await?;
        let mut recovered = Vec::new();
        for task in self.load_all().await? {
            let owner_alive = task
                .claimed_by
                .as_ref()
                .is_some_and(|owner| live.contains(owner));
            if task.status != TaskStatus::Running || owner_alive || in_flight.contains(&task.id) {
                continue;
            }
            let update = StatusUpdate::default().with_error("interrupted: reset after restart");
            match self.update_status(&task.id, TaskStatus::Pending, update).await {
                Ok(_) => {}
                // Finished or removed since it was listed.
                Err(QueueError::InvalidTransition { .. } | QueueError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
            warn!(
                task_id = %task.id,
                owner = task.claimed_by.as_deref().unwrap_or("none"),
                "Reset stale running task to pending"
            );
            recovered.push(task.id);
        }
        Ok(recovered)
    }

    /// Write or refresh the lease of a pass.
    pub async fn refresh_lease(&self, owner: &str) -> Result<(), QueueError> {
        self.write_lease(&Lease::new(owner)).await
    }

    async fn write_lease(&self, lease: &Lease) -> Result<(), QueueError> {
        id::validate(&lease.owner)?;
        write_record(&self.leases_dir, &lease.owner, lease).await
    }

    /// Drop the lease of a pass. A missing lease is not an error.
    pub async fn release_lease(&self, owner: &str) -> Result<(), QueueError> {
        id::validate(owner)?;
        let path = self.leases_dir.join(format!("{owner}.{RECORD_EXTENSION}"));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(path, e)),
        }
    }

    /// Owners whose lease was refreshed within [`LEASE_TTL`].
    pub async fn live_owners(&self) -> Result<HashSet<String>, QueueError> {
        let now = Utc::now();
        Ok(read_records::<Lease>(&self.leases_dir)
            .await?
            .into_iter()
            .filter(|lease| lease.is_fresh(now, LEASE_TTL))
            .map(|lease| lease.owner)
            .collect())
    }

    /// Read every task record. Unreadable or malformed files are skipped.
    async fn load_all(&self) -> Result<Vec<Task>, QueueError> {
        read_records(&self.dir).await
    }

    async fn write(&self, task: &Task) -> Result<(), QueueError> {
        write_record(&self.dir, &task.id, task).await
    }
}

/// Read every `*.json` record in `dir`. Unreadable or malformed files are skipped.
async fn read_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, QueueError> {
    let mut read_dir = fs::read_dir(dir)
        .await
        .map_err(|e| QueueError::io(dir, e))?;

    let mut records = Vec::new();
    loop {
        let entry = match read_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(QueueError::io(dir, e)),
        };
        let path = entry.path();
        if !is_record_file(&path) {
            continue;
        }
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            // Removed between listing and reading.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read record");
                continue;
            }
        };
        match serde_json::from_slice::<T>(&bytes) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed record");
            }
        }
    }
    Ok(records)
}

/// Atomically persist `<dir>/<stem>.json`: temp file, then rename over the target.
async fn write_record<T: Serialize>(dir: &Path, stem: &str, value: &T) -> Result<(), QueueError> {
    let path = dir.join(format!("{stem}.{RECORD_EXTENSION}"));
    let data = serde_json::to_vec_pretty(value).map_err(|source| QueueError::Serialization {
        path: path.clone(),
        source,
    })?;

    let tmp_path = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4().simple()));
    if let Err(e) = fs::write(&tmp_path, &data).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(QueueError::io(tmp_path, e));
    }
    if let Err(e) = fs::rename(&tmp_path, &path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(QueueError::io(path, e));
    }
    Ok(())
}

fn is_record_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::{Priority, TaskOutput};
    use tempfile::TempDir;

    async fn test_store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn open_creates_tasks_dir() {
        let (store, dir) = test_store().await;
        assert!(dir.path().join(TASKS_DIR).is_dir());
        assert_eq!(store.dir(), dir.path().join(TASKS_DIR));
    }

    #[tokio::test]
    async fn add_generates_slug_id() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Write README")).await.unwrap();
        assert!(task.id.starts_with("write-readme-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::P2);
        assert!(store.record_path(&task.id).exists());
    }

    #[tokio::test]
    async fn add_same_description_twice_gets_distinct_ids() {
        let (store, _dir) = test_store().await;
        let first = store.add(NewTask::new("Fix bug")).await.unwrap();
        let second = store.add(NewTask::new("Fix bug")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn add_rejects_blank_description() {
        let (store, _dir) = test_store().await;
        let err = store.add(NewTask::new("   \n\t")).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation { .. }));
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn add_rejects_self_dependency() {
        let (store, _dir) = test_store().await;
        let err = store
            .add(NewTask::new("Loop").with_id("loop").depends_on("loop"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation { .. }));
    }

    #[tokio::test]
    async fn add_rejects_unsafe_explicit_id() {
        let (store, _dir) = test_store().await;
        let err = store
            .add(NewTask::new("Escape").with_id("../outside"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation { .. }));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.get("nope").await,
            Err(QueueError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("../nope").await,
            Err(QueueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn get_corrupt_record_is_serialization_error() {
        let (store, _dir) = test_store().await;
        std::fs::write(store.record_path("broken"), "{ not json").unwrap();
        assert!(matches!(
            store.get("broken").await,
            Err(QueueError::Serialization { .. })
        ));
        // Listing skips it instead of failing.
        assert!(store.list(TaskFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_ignores_temp_files() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Real")).await.unwrap();
        std::fs::write(store.dir().join(".real.123.tmp"), "partial").unwrap();
        std::fs::write(store.dir().join("notes.txt"), "hello").unwrap();
        let listed = store.list(TaskFilter::all()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, task.id);
    }

    #[tokio::test]
    async fn update_status_sets_timestamps() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Timed")).await.unwrap();
        assert!(task.started_at.is_none());

        let running = store
            .update_status(&task.id, TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());
        assert_eq!(running.iteration, 1);
        assert!(running.updated_at >= task.updated_at);

        let done = store
            .update_status(
                &task.id,
                TaskStatus::Complete,
                StatusUpdate {
                    confidence: Some(0.875),
                    pr_url: Some("https://example.com/pr/7".into()),
                    pr_number: Some(7),
                    output: Some(TaskOutput::default().with_summary("done")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.started_at, running.started_at);
        assert_eq!(done.confidence, Some(0.875));
        assert_eq!(done.pr_number, Some(7));
        assert_eq!(store.get(&task.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn update_status_keeps_unset_fields() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Keep")).await.unwrap();
        store
            .update_status(
                &task.id,
                TaskStatus::Running,
                StatusUpdate::default().with_workspace("/tmp/ws", Some("tasksmith/keep".into())),
            )
            .await
            .unwrap();
        let failed = store
            .update_status(
                &task.id,
                TaskStatus::Failed,
                StatusUpdate::default().with_error("boom"),
            )
            .await
            .unwrap();
        assert_eq!(failed.workspace_path, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(failed.branch.as_deref(), Some("tasksmith/keep"));
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn confidence_survives_reload_bit_for_bit() {
        let (store, dir) = test_store().await;

        // splitmix64, so the sample is fixed but not hand-picked
        let mut seed = 0x9E37_79B9_7F4A_7C15_u64;
        let mut next = move || {
            seed = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = seed;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^ (z >> 31)
        };

        let mut expected = Vec::new();
        for i in 0..200 {
            let confidence = (next() >> 11) as f64 / (1u64 << 53) as f64;
            let task = store.add(NewTask::new(format!("score {i}"))).await.unwrap();
            store
                .update_status(
                    &task.id,
                    TaskStatus::Complete,
                    StatusUpdate {
                        confidence: Some(confidence),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            expected.push((task.id, confidence));
        }

        let reopened = TaskStore::open(dir.path()).await.unwrap();
        for (id, confidence) in expected {
            let loaded = reopened.get(&id).await.unwrap().confidence.unwrap();
            assert_eq!(loaded.to_bits(), confidence.to_bits(), "task {id}");
        }
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Final")).await.unwrap();
        store
            .update_status(&task.id, TaskStatus::Complete, StatusUpdate::default())
            .await
            .unwrap();
        let err = store
            .update_status(&task.id, TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(store.get(&task.id).await.unwrap().status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let (store, _dir) = test_store().await;
        let err = store
            .update_status("ghost", TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_records_reason() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Cancel me")).await.unwrap();
        let cancelled = store.cancel(&task.id, Some("superseded")).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("superseded"));
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_orders_and_filters() {
        let (store, _dir) = test_store().await;
        let low = store
            .add(NewTask::new("Low").with_priority(Priority::P3))
            .await
            .unwrap();
        let high = store
            .add(NewTask::new("High").with_priority(Priority::P0))
            .await
            .unwrap();
        let done = store
            .add(NewTask::new("Done").with_priority(Priority::P0))
            .await
            .unwrap();
        store
            .update_status(&done.id, TaskStatus::Complete, StatusUpdate::default())
            .await
            .unwrap();

        let active: Vec<String> = store
            .list(TaskFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(active, vec![high.id.clone(), low.id.clone()]);

        let all = store.list(TaskFilter::all()).await.unwrap();
        assert_eq!(all.len(), 3);

        let completed = store
            .list(TaskFilter::status(TaskStatus::Complete))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);

        let p3 = store
            .list(TaskFilter {
                priority: Some(Priority::P3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(p3.len(), 1);
        assert_eq!(p3[0].id, low.id);
    }

    #[tokio::test]
    async fn next_follows_dependencies() {
        let (store, _dir) = test_store().await;
        let a = store
            .add(NewTask::new("A").with_priority(Priority::P2))
            .await
            .unwrap();
        let b = store
            .add(NewTask::new("B").with_priority(Priority::P0).depends_on(&a.id))
            .await
            .unwrap();

        assert_eq!(store.next().await.unwrap().unwrap().id, a.id);
        store
            .update_status(&a.id, TaskStatus::Complete, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(store.next().await.unwrap().unwrap().id, b.id);
        store
            .update_status(&b.id, TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        assert!(store.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let (store, _dir) = test_store().await;
        let a = store.add(NewTask::new("A")).await.unwrap();
        let b = store.add(NewTask::new("B")).await.unwrap();
        let c = store.add(NewTask::new("C")).await.unwrap();
        store
            .update_status(&b.id, TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap();

        assert!(store.remove(&a.id).await.unwrap());
        assert!(!store.remove(&a.id).await.unwrap());

        assert_eq!(store.clear(false).await.unwrap(), 1);
        assert!(matches!(store.get(&c.id).await, Err(QueueError::NotFound { .. })));
        assert_eq!(store.get(&b.id).await.unwrap().status, TaskStatus::Running);

        assert_eq!(store.clear(true).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn stats_counts_each_status() {
        let (store, _dir) = test_store().await;
        let a = store.add(NewTask::new("A")).await.unwrap();
        let b = store.add(NewTask::new("B")).await.unwrap();
        store.add(NewTask::new("C")).await.unwrap();
        store
            .update_status(&a.id, TaskStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        store
            .update_status(&b.id, TaskStatus::Failed, StatusUpdate::default())
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.count(TaskStatus::Complete), 0);
    }

    #[tokio::test]
    async fn recover_stale_resets_running() {
        let (store, _dir) = test_store().await;
        let stale = store.add(NewTask::new("Stale")).await.unwrap();
        let live = store.add(NewTask::new("Live")).await.unwrap();
        for id in [&stale.id, &live.id] {
            store
                .update_status(id, TaskStatus::Running, StatusUpdate::default())
                .await
                .unwrap();
        }

        let recovered = store.recover_stale(&[live.id.clone()]).await.unwrap();
        assert_eq!(recovered, vec![stale.id.clone()]);
        assert_eq!(store.get(&stale.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get(&live.id).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn recover_stale_spares_tasks_with_a_live_owner() {
        let (store, _dir) = test_store().await;
        store.refresh_lease("pool-live").await.unwrap();
        store
            .write_lease(&Lease {
                owner: "pool-expired".to_string(),
                pid: 1,
                refreshed_at: Utc::now() - chrono::Duration::minutes(5),
            })
            .await
            .unwrap();

        let mut ids = Vec::new();
        for owner in ["pool-live", "pool-expired", "pool-unknown"] {
            let task = store.add(NewTask::new(format!("claimed by {owner}"))).await.unwrap();
            store
                .update_status(
                    &task.id,
                    TaskStatus::Running,
                    StatusUpdate::default().claimed_by(owner),
                )
                .await
                .unwrap();
            ids.push(task.id);
        }

        let mut recovered = store.recover_stale(&[]).await.unwrap();
        recovered.sort();
        let mut expected = vec![ids[1].clone(), ids[2].clone()];
        expected.sort();
        assert_eq!(recovered, expected);

        let kept = store.get(&ids[0]).await.unwrap();
        assert_eq!(kept.status, TaskStatus::Running);
        assert_eq!(kept.claimed_by.as_deref(), Some("pool-live"));
        let reset = store.get(&ids[1]).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert!(reset.claimed_by.is_none());
    }

    #[tokio::test]
    async fn released_lease_is_no_longer_live() {
        let (store, _dir) = test_store().await;
        store.refresh_lease("pool-a").await.unwrap();
        assert!(store.live_owners().await.unwrap().contains("pool-a"));

        store.release_lease("pool-a").await.unwrap();
        store.release_lease("pool-a").await.unwrap();
        assert!(store.live_owners().await.unwrap().is_empty());
        assert!(store.refresh_lease("../escape").await.is_err());
    }

    #[tokio::test]
    async fn claim_is_kept_while_running_and_cleared_after() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Claimed")).await.unwrap();
        store
            .update_status(
                &task.id,
                TaskStatus::Running,
                StatusUpdate::default().claimed_by("pool-a"),
            )
            .await
            .unwrap();
        let running = store
            .update_status(
                &task.id,
                TaskStatus::Running,
                StatusUpdate::default().with_workspace("/tmp/ws", None),
            )
            .await
            .unwrap();
        assert_eq!(running.claimed_by.as_deref(), Some("pool-a"));

        let done = store
            .update_status(&task.id, TaskStatus::Complete, StatusUpdate::default())
            .await
            .unwrap();
        assert!(done.claimed_by.is_none());
    }

    #[tokio::test]
    async fn claim_is_won_once() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Contended")).await.unwrap();

        let won = store.claim(&task.id, "pool-a").await.unwrap();
        assert_eq!(won.status, TaskStatus::Running);
        assert_eq!(won.claimed_by.as_deref(), Some("pool-a"));
        assert_eq!(won.iteration, 1);

        let err = store.claim(&task.id, "pool-b").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        let stored = store.get(&task.id).await.unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("pool-a"));
        assert_eq!(stored.iteration, 1);
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files() {
        let (store, _dir) = test_store().await;
        let task = store.add(NewTask::new("Clean")).await.unwrap();
        store
            .update_status(&task.id, TaskStatus::Ready, StatusUpdate::default())
            .await
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}.json", task.id)]);
    }
}
