//! Dependency-aware ready-set computation.
//!
//! A task is ready when it is PENDING or READY and every dependency id
//! resolves to a COMPLETE task. Unknown dependency ids block the task.

use std::collections::HashMap;

use serde::Serialize;

use super::model::{Task, TaskStatus};

/// Status lookup by task id.
pub(crate) type StatusIndex<'a> = HashMap<&'a str, TaskStatus>;

pub(crate) fn index(tasks: &[Task]) -> StatusIndex<'_> {
    tasks.iter().map(|t| (t.id.as_str(), t.status)).collect()
}

/// Check whether a single task is dispatchable given the status of every task.
pub(crate) fn is_ready(task: &Task, statuses: &StatusIndex<'_>) -> bool {
    task.status.is_dispatchable()
        && task
            .dependencies
            .iter()
            .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Complete))
}

/// All ready tasks, most urgent first (priority, then creation time, then id).
pub fn ready_tasks(tasks: &[Task]) -> Vec<Task> {
    let statuses = index(tasks);
    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| is_ready(t, &statuses))
        .cloned()
        .collect();
    ready.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
    ready
}

/// Problems that keep non-terminal tasks from ever becoming ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// `(task_id, missing_dependency_id)` pairs.
    pub unresolved: Vec<(String, String)>,
    /// Dependency cycles, each listed as a closed path (`a -> b -> a`).
    pub cycles: Vec<Vec<String>>,
}

impl DependencyReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.cycles.is_empty()
    }
}

/// Find unresolved dependencies and cycles among non-terminal tasks.
pub fn dependency_report(tasks: &[Task]) -> DependencyReport {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut report = DependencyReport::default();

    let mut active: Vec<&Task> = tasks.iter().filter(|t| !t.is_terminal()).collect();
    active.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));

    for task in &active {
        for dep in &task.dependencies {
            if !by_id.contains_key(dep.as_str()) {
                report.unresolved.push((task.id.clone(), dep.clone()));
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for task in &active {
        if !marks.contains_key(task.id.as_str()) {
            let mut stack = Vec::new();
            collect_cycles(
                task.id.as_str(),
                &by_id,
                &mut marks,
                &mut stack,
                &mut report.cycles,
            );
        }
    }

    report
}

/// DFS colouring: a node is `OnStack` while its dependencies are being
/// walked and `Done` once every path out of it has been explored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// DFS over dependency edges, recording one cycle per back edge found.
fn collect_cycles<'a>(
    node: &'a str,
    by_id: &HashMap<&'a str, &'a Task>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks.insert(node, Mark::OnStack);
    stack.push(node);

    if let Some(&task) = by_id.get(node) {
        for dep in &task.dependencies {
            let Some((&key, _)) = by_id.get_key_value(dep.as_str()) else {
                continue;
            };
            match marks.get(key) {
                Some(Mark::OnStack) => {
                    if let Some(pos) = stack.iter().position(|n| *n == key) {
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|n| n.to_string()).collect();
                        cycle.push(key.to_string());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => collect_cycles(key, by_id, marks, stack, cycles),
            }
        }
    }

    stack.pop();
    marks.insert(node, Mark::Done);
}
