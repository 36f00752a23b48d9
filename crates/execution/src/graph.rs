//! Task dependency graph and status engine.
//!
//! The graph owns every task record. Status changes go through
//! [`Task::transition`]; terminal failures cascade to dependents:
//! an `ERROR` predecessor fails its successors, a `CANCELLED` or `STOPPED`
//! one cancels them.

use std::collections::{BTreeSet, HashMap, HashSet};
use labman_core::{ExperimentId, InvalidTransition, Task, TaskFilter, TaskId, TaskStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Errors from graph edits.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// The edit would close a cycle; lists the tasks on it
    #[error("dependency cycle: {}", format_cycle(.0))]
    CycleDetected(Vec<TaskId>),

    /// No such task
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Edge to a task that is neither admitted nor in the batch
    #[error("task {task} refers to unknown task {missing}")]
    UnknownEdge {
        /// Task holding the edge
        task: TaskId,
        /// Missing endpoint
        missing: TaskId,
    },

    /// Task id already admitted
    #[error("task already admitted: {0}")]
    DuplicateTask(TaskId),

    /// Edges of a task that has started cannot change
    #[error("task {task} is {status}; only WAITING or READY tasks can be edited")]
    NotEditable {
        /// Task
        task: TaskId,
        /// Its status
        status: TaskStatus,
    },

    /// Illegal status change
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> ")
}

/// What [`TaskGraph::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task never started and is now `CANCELLED`
    Cancelled,
    /// The task is executing; its logic must be interrupted and the
    /// terminal status arrives from the executor
    Interrupt,
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// All tasks
    pub total: usize,
    /// WAITING
    pub waiting: usize,
    /// READY
    pub ready: usize,
    /// REQUESTING_RESOURCES
    pub requesting: usize,
    /// RUNNING
    pub running: usize,
    /// PAUSED
    pub paused: usize,
    /// COMPLETED
    pub completed: usize,
    /// ERROR
    pub error: usize,
    /// STOPPED
    pub stopped: usize,
    /// CANCELLED
    pub cancelled: usize,
}

impl GraphStats {
    /// Tasks not yet terminal.
    pub fn pending(&self) -> usize {
        self.waiting + self.ready + self.requesting + self.running + self.paused
    }
}

/// Find a cycle in a successor map with a depth-first search.
///
/// Returns the tasks on the first cycle found, in edge order.
pub fn find_cycle(successors: &HashMap<TaskId, Vec<TaskId>>) -> Option<Vec<TaskId>> {
    let mut nodes: Vec<&TaskId> = successors.keys().collect();
    nodes.sort();

    let mut visited = HashSet::new();
    for node in nodes {
        if visited.contains(node) {
            continue;
        }
        let mut recursion_stack = HashSet::new();
        let mut path = Vec::new();
        if let Some(cycle) = visit(*node, successors, &mut visited, &mut recursion_stack, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    node: TaskId,
    successors: &HashMap<TaskId, Vec<TaskId>>,
    visited: &mut HashSet<TaskId>,
    recursion_stack: &mut HashSet<TaskId>,
    path: &mut Vec<TaskId>,
) -> Option<Vec<TaskId>> {
    visited.insert(node);
    recursion_stack.insert(node);
    path.push(node);

    for next in successors.get(&node).into_iter().flatten() {
        if !visited.contains(next) {
            if let Some(cycle) = visit(*next, successors, visited, recursion_stack, path) {
                return Some(cycle);
            }
        } else if recursion_stack.contains(next) {
            let start = path.iter().position(|id| id == next).unwrap_or(0);
            return Some(path[start..].to_vec());
        }
    }

    path.pop();
    recursion_stack.remove(&node);
    None
}

/// Check a standalone batch for cycles among its own edges.
pub fn batch_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
    let mut successors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        successors.entry(task.id).or_default().extend(task.successors.iter().copied());
        for pred in &task.predecessors {
            successors.entry(*pred).or_default().push(task.id);
        }
    }
    find_cycle(&successors)
}

fn is_editable(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Waiting | TaskStatus::Ready)
}

fn push_unique(list: &mut Vec<TaskId>, id: TaskId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// All admitted tasks and their edges.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    next_seq: u64,
    dirty: BTreeSet<TaskId>,
}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task was admitted.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task record.
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Tasks matching `filter`, in admission order.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Tasks of an experiment.
    pub fn experiment_tasks(&self, experiment: ExperimentId) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.experiment == Some(experiment)).collect()
    }

    /// Ids changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, GraphError> {
        self.dirty.insert(id);
        self.tasks.get_mut(&id).ok_or(GraphError::TaskNotFound(id))
    }

    fn status(&self, id: TaskId) -> Result<TaskStatus, GraphError> {
        self.tasks.get(&id).map(|t| t.status).ok_or(GraphError::TaskNotFound(id))
    }

    /// Successor map of the whole graph.
    fn successor_map(&self) -> HashMap<TaskId, Vec<TaskId>> {
        self.tasks.iter().map(|(id, t)| (*id, t.successors.clone())).collect()
    }

    /// Admit a batch of tasks.
    ///
    /// Edges may point at tasks in the batch or already admitted. The batch
    /// is rejected as a whole on a missing endpoint or a cycle. Roots start
    /// `READY`, everything else `WAITING` until its predecessors complete.
    pub fn admit(&mut self, batch: Vec<Task>) -> Result<Vec<TaskId>, GraphError> {
        let mut ids = HashSet::new();
        for task in &batch {
            if self.tasks.contains_key(&task.id) || !ids.insert(task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
        }

        let mut successors = self.successor_map();
        for task in &batch {
            for edge in task.predecessors.iter().chain(&task.successors) {
                if !ids.contains(edge) && !self.tasks.contains_key(edge) {
                    return Err(GraphError::UnknownEdge { task: task.id, missing: *edge });
                }
            }
            for succ in &task.successors {
                if let Some(existing) = self.tasks.get(succ) {
                    if !is_editable(existing.status) {
                        return Err(GraphError::NotEditable { task: *succ, status: existing.status });
                    }
                }
            }
            push_all(successors.entry(task.id).or_default(), &task.successors);
            for pred in &task.predecessors {
                push_unique(successors.entry(*pred).or_default(), task.id);
            }
        }
        if let Some(cycle) = find_cycle(&successors) {
            warn!("Rejected batch of {} tasks: cycle {}", batch.len(), format_cycle(&cycle));
            return Err(GraphError::CycleDetected(cycle));
        }

        let admitted: Vec<TaskId> = batch.iter().map(|t| t.id).collect();
        let mut touched = Vec::new();
        for mut task in batch {
            task.status = TaskStatus::Waiting;
            task.seq = self.next_seq;
            self.next_seq += 1;
            let id = task.id;
            let (preds, succs) = (task.predecessors.clone(), task.successors.clone());
            self.tasks.insert(id, task);
            self.dirty.insert(id);
            for pred in preds {
                self.link(pred, id);
            }
            for succ in succs {
                self.link(id, succ);
                touched.push(succ);
            }
        }

        for id in admitted.iter().chain(&touched) {
            self.mark_ready_if_eligible(*id)?;
        }
        info!("Admitted {} tasks", admitted.len());
        Ok(admitted)
    }

    fn link(&mut self, from: TaskId, to: TaskId) {
        if let Some(task) = self.tasks.get_mut(&from) {
            push_unique(&mut task.successors, to);
            self.dirty.insert(from);
        }
        if let Some(task) = self.tasks.get_mut(&to) {
            push_unique(&mut task.predecessors, from);
            self.dirty.insert(to);
        }
    }

    fn unlink(&mut self, from: TaskId, to: TaskId) {
        if let Some(task) = self.tasks.get_mut(&from) {
            task.successors.retain(|id| *id != to);
            self.dirty.insert(from);
        }
        if let Some(task) = self.tasks.get_mut(&to) {
            task.predecessors.retain(|id| *id != from);
            self.dirty.insert(to);
        }
    }

    /// Re-evaluate a `WAITING` or `READY` task against its predecessors and
    /// cascade any failure through its dependents. Returns the task's
    /// resulting status.
    pub fn mark_ready_if_eligible(&mut self, id: TaskId) -> Result<TaskStatus, GraphError> {
        let mut queue = vec![id];
        while let Some(next) = queue.pop() {
            if let Some(failed) = self.evaluate(next)? {
                queue.extend(failed);
            }
        }
        self.status(id)
    }

    /// Apply the readiness rule to one task. Returns its successors when it
    /// just failed, so the caller can continue the cascade.
    fn evaluate(&mut self, id: TaskId) -> Result<Option<Vec<TaskId>>, GraphError> {
        let task = self.tasks.get(&id).ok_or(GraphError::TaskNotFound(id))?;
        if !is_editable(task.status) {
            return Ok(None);
        }

        let mut errored = None;
        let mut cancelled = None;
        let mut all_complete = true;
        for pred in &task.predecessors {
            match self.status(*pred)? {
                TaskStatus::Completed => {}
                TaskStatus::Error => {
                    errored.get_or_insert(*pred);
                }
                TaskStatus::Cancelled | TaskStatus::Stopped => {
                    cancelled.get_or_insert(*pred);
                }
                _ => all_complete = false,
            }
        }

        let current = task.status;
        let (next, reason) = match (errored, cancelled) {
            (Some(pred), _) => (TaskStatus::Error, Some(format!("predecessor {} failed", pred))),
            (None, Some(pred)) => {
                (TaskStatus::Cancelled, Some(format!("predecessor {} did not complete", pred)))
            }
            (None, None) if all_complete => (TaskStatus::Ready, None),
            (None, None) => (TaskStatus::Waiting, None),
        };
        if next == current {
            return Ok(None);
        }

        let task = self.task_mut(id)?;
        task.transition(next)?;
        if let Some(reason) = reason {
            info!("Task {} -> {}: {}", id, next, reason);
            task.message = reason;
            return Ok(Some(task.successors.clone()));
        }
        debug!("Task {} -> {}", id, next);
        Ok(None)
    }

    /// `READY` tasks by descending priority, then admission order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<&Task> =
            self.tasks.values().filter(|t| t.status == TaskStatus::Ready).collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)));
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Tasks waiting on a reservation, in admission order.
    pub fn requesting_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::RequestingResources)
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Tasks executing or paused.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.tasks.values().filter(|t| t.status.is_active()).map(|t| t.id).collect()
    }

    /// Whether every task is terminal.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Move a status without side effects on other tasks.
    pub fn transition(&mut self, id: TaskId, next: TaskStatus) -> Result<(), GraphError> {
        self.task_mut(id)?.transition(next)?;
        debug!("Task {} -> {}", id, next);
        Ok(())
    }

    /// `READY` → `REQUESTING_RESOURCES`.
    pub fn begin_acquire(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.transition(id, TaskStatus::RequestingResources)
    }

    /// `REQUESTING_RESOURCES` → `RUNNING`.
    pub fn mark_running(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.transition(id, TaskStatus::Running)?;
        info!("Task {} running", id);
        Ok(())
    }

    /// Record a terminal status and propagate it to dependents.
    pub fn finish(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        message: Option<String>,
    ) -> Result<(), GraphError> {
        let task = self.task_mut(id)?;
        task.transition(status)?;
        if result.is_some() {
            task.result = result;
        }
        if let Some(message) = message {
            task.message = message;
        }
        let successors = task.successors.clone();
        info!("Task {} finished: {}", id, status);

        for succ in successors {
            self.mark_ready_if_eligible(succ)?;
        }
        Ok(())
    }

    /// Attach a progress message.
    pub fn set_message(&mut self, id: TaskId, message: String) -> Result<(), GraphError> {
        self.task_mut(id)?.message = message;
        Ok(())
    }

    /// Cancel a task. Tasks that never started are cancelled at once; running
    /// ones must be interrupted by the caller.
    pub fn cancel(&mut self, id: TaskId) -> Result<CancelOutcome, GraphError> {
        let status = self.status(id)?;
        match status {
            TaskStatus::Waiting | TaskStatus::Ready | TaskStatus::RequestingResources => {
                self.finish(id, TaskStatus::Cancelled, None, Some("cancelled".to_string()))?;
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Running | TaskStatus::Paused => {
                self.set_message(id, "cancellation requested".to_string())?;
                Ok(CancelOutcome::Interrupt)
            }
            _ => Err(InvalidTransition { task: id, from: status, to: TaskStatus::Cancelled }.into()),
        }
    }

    /// `RUNNING` → `PAUSED`.
    pub fn pause(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.transition(id, TaskStatus::Paused)
    }

    /// `PAUSED` → `RUNNING`.
    pub fn resume(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.transition(id, TaskStatus::Running)
    }

    /// Replace a task's predecessors and successors.
    ///
    /// The task and its new successors must not have started. The edit is
    /// checked for cycles before anything changes; afterwards readiness is
    /// re-evaluated, so a `READY` task that gains an unfinished predecessor
    /// goes back to `WAITING`.
    pub fn update_dependency(
        &mut self,
        id: TaskId,
        predecessors: Vec<TaskId>,
        successors: Vec<TaskId>,
    ) -> Result<(), GraphError> {
        let status = self.status(id)?;
        if !is_editable(status) {
            return Err(GraphError::NotEditable { task: id, status });
        }
        for edge in predecessors.iter().chain(&successors) {
            if *edge == id {
                return Err(GraphError::CycleDetected(vec![id]));
            }
            if !self.tasks.contains_key(edge) {
                return Err(GraphError::UnknownEdge { task: id, missing: *edge });
            }
        }
        for succ in &successors {
            let status = self.status(*succ)?;
            if !is_editable(status) {
                return Err(GraphError::NotEditable { task: *succ, status });
            }
        }

        let (old_preds, old_succs) = {
            let task = self.tasks.get(&id).ok_or(GraphError::TaskNotFound(id))?;
            (task.predecessors.clone(), task.successors.clone())
        };

        let mut map = self.successor_map();
        for pred in &old_preds {
            if let Some(list) = map.get_mut(pred) {
                list.retain(|t| *t != id);
            }
        }
        map.insert(id, successors.clone());
        for pred in &predecessors {
            push_unique(map.entry(*pred).or_default(), id);
        }
        if let Some(cycle) = find_cycle(&map) {
            warn!("Rejected edit of task {}: cycle {}", id, format_cycle(&cycle));
            return Err(GraphError::CycleDetected(cycle));
        }

        for pred in &old_preds {
            self.unlink(*pred, id);
        }
        for succ in &old_succs {
            self.unlink(id, *succ);
        }
        for pred in &predecessors {
            self.link(*pred, id);
        }
        for succ in &successors {
            self.link(id, *succ);
        }

        info!(
            "Task {} now after {} tasks, before {} tasks",
            id,
            predecessors.len(),
            successors.len()
        );
        self.mark_ready_if_eligible(id)?;
        for succ in old_succs.iter().chain(&successors) {
            self.mark_ready_if_eligible(*succ)?;
        }
        Ok(())
    }

    /// Insert `task` directly after `after`, taking over the successors of
    /// `after` that have not started yet.
    pub fn reroute(&mut self, after: TaskId, mut task: Task) -> Result<TaskId, GraphError> {
        let taken: Vec<TaskId> = {
            let anchor = self.tasks.get(&after).ok_or(GraphError::TaskNotFound(after))?;
            anchor
                .successors
                .iter()
                .copied()
                .filter(|s| self.tasks.get(s).map(|t| is_editable(t.status)).unwrap_or(false))
                .collect()
        };

        push_unique(&mut task.predecessors, after);
        for succ in &taken {
            push_unique(&mut task.successors, *succ);
        }
        let id = task.id;
        self.admit(vec![task])?;

        for succ in &taken {
            self.unlink(after, *succ);
            self.mark_ready_if_eligible(*succ)?;
        }
        info!("Rerouted {} successors of {} through {}", taken.len(), after, id);
        Ok(id)
    }

    /// Counts per status.
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats { total: self.tasks.len(), ..Default::default() };
        for task in self.tasks.values() {
            let counter = match task.status {
                TaskStatus::Waiting => &mut stats.waiting,
                TaskStatus::Ready => &mut stats.ready,
                TaskStatus::RequestingResources => &mut stats.requesting,
                TaskStatus::Running => &mut stats.running,
                TaskStatus::Paused => &mut stats.paused,
                TaskStatus::Completed => &mut stats.completed,
                TaskStatus::Error => &mut stats.error,
                TaskStatus::Stopped => &mut stats.stopped,
                TaskStatus::Cancelled => &mut stats.cancelled,
            };
            *counter += 1;
        }
        stats
    }
}

fn push_all(list: &mut Vec<TaskId>, ids: &[TaskId]) {
    for id in ids {
        push_unique(list, *id);
    }
}
