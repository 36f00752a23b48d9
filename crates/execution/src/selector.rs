//! Ordering of tasks waiting on a reservation.

use std::collections::HashMap;
use labman_core::{Task, TaskId, TaskPriority};
use tracing::warn;

/// Effective priority never ages past this, so aged work stays behind
/// `URGENT` tasks.
pub const AGING_CAP: u32 = 99;

/// Priority gained per aging period.
pub const AGING_STEP: u32 = 10;

/// Orders requesting tasks by effective priority, then admission order.
///
/// A task that fails to reserve for `aging_ticks` consecutive ticks gains
/// [`AGING_STEP`] effective priority per period, up to [`AGING_CAP`].
#[derive(Debug, Clone)]
pub struct TaskSelector {
    aging_ticks: u32,
    blocked: HashMap<TaskId, u32>,
}

impl TaskSelector {
    /// Selector aging every `aging_ticks` blocked ticks; 0 disables aging.
    pub fn new(aging_ticks: u32) -> Self {
        Self { aging_ticks, blocked: HashMap::new() }
    }

    /// Consecutive blocked ticks of a task.
    pub fn blocked_ticks(&self, task: TaskId) -> u32 {
        self.blocked.get(&task).copied().unwrap_or(0)
    }

    /// Priority used for ordering.
    pub fn effective_priority(&self, task: &Task) -> u32 {
        let base = task.priority.value();
        if self.aging_ticks == 0 || base >= AGING_CAP {
            return base;
        }
        let periods = self.blocked_ticks(task.id) / self.aging_ticks;
        (base + AGING_STEP * periods).min(AGING_CAP)
    }

    /// Order tasks for this tick's reservation attempts.
    pub fn order(&self, tasks: &[&Task]) -> Vec<TaskId> {
        let mut ordered: Vec<(u32, u64, TaskId)> =
            tasks.iter().map(|t| (self.effective_priority(t), t.seq, t.id)).collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ordered.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Note a failed reservation attempt.
    pub fn record_blocked(&mut self, task: &Task) -> u32 {
        let ticks = self.blocked.entry(task.id).or_insert(0);
        *ticks += 1;
        if self.aging_ticks > 0 && *ticks % self.aging_ticks == 0 && task.priority < TaskPriority::Urgent {
            warn!("Task {} blocked for {} ticks", task.id, ticks);
        }
        *ticks
    }

    /// Forget a task once it was granted or left the queue.
    pub fn clear(&mut self, task: TaskId) {
        self.blocked.remove(&task);
    }
}

impl Default for TaskSelector {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut low = Task::new("noop").with_priority(TaskPriority::Low);
        let mut a = Task::new("noop");
        let mut b = Task::new("noop");
        let mut high = Task::new("noop").with_priority(TaskPriority::High);
        for (seq, t) in [&mut low, &mut a, &mut b, &mut high].into_iter().enumerate() {
            t.seq = seq as u64;
        }

        let selector = TaskSelector::new(5);
        assert_eq!(selector.order(&[&b, &low, &high, &a]), vec![high.id, a.id, b.id, low.id]);
    }

    #[test]
    fn test_aging() {
        let mut low = Task::new("noop").with_priority(TaskPriority::Low);
        low.seq = 0;
        let mut high = Task::new("noop").with_priority(TaskPriority::High);
        high.seq = 1;

        let mut selector = TaskSelector::new(2);
        for _ in 0..4 {
            selector.record_blocked(&low);
        }
        assert_eq!(selector.effective_priority(&low), 30);
        // equal effective priority falls back to admission order
        assert_eq!(selector.order(&[&high, &low]), vec![low.id, high.id]);

        for _ in 0..100 {
            selector.record_blocked(&low);
        }
        assert_eq!(selector.effective_priority(&low), AGING_CAP);

        let urgent = Task::new("noop").with_priority(TaskPriority::Urgent);
        assert_eq!(selector.order(&[&low, &urgent])[0], urgent.id);

        selector.clear(low.id);
        assert_eq!(selector.effective_priority(&low), 10);
    }

    #[test]
    fn test_aging_disabled() {
        let low = Task::new("noop").with_priority(TaskPriority::Low);
        let mut selector = TaskSelector::new(0);
        selector.record_blocked(&low);
        assert_eq!(selector.effective_priority(&low), 10);
    }
}
