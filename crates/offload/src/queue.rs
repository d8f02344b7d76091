//! Pending task queue
//!
//! Orders waiting tasks by priority class, then arrival. Retries are
//! re-inserted into the high class so partially completed work is picked up
//! before fresh submissions.

use std::collections::{BTreeMap, VecDeque};

use crate::task::{Priority, TaskId};

/// Tasks of one task type waiting for a free unit
#[derive(Debug, Default)]
pub struct TaskQueue {
    classes: BTreeMap<Priority, VecDeque<TaskId>>,
    len: usize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the back of its priority class
    pub fn push(&mut self, task_id: TaskId, priority: Priority) {
        self.classes.entry(priority).or_default().push_back(task_id);
        self.len += 1;
    }

    /// Re-insert a task that is being retried
    pub fn push_retry(&mut self, task_id: TaskId) {
        self.push(task_id, Priority::High);
    }

    /// Take the next task: highest class first, oldest first within a class
    pub fn pop(&mut self) -> Option<TaskId> {
        let task_id = self
            .classes
            .values_mut()
            .find(|class| !class.is_empty())
            .and_then(VecDeque::pop_front)?;
        self.len -= 1;
        Some(task_id)
    }

    /// Remove a specific task, wherever it sits. O(n).
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        for class in self.classes.values_mut() {
            if let Some(pos) = class.iter().position(|id| *id == task_id) {
                class.remove(pos);
                self.len -= 1;
                return true;
            }
        }
        false
    }

    /// Remove every task in dispatch order
    pub fn drain(&mut self) -> Vec<TaskId> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(task_id) = self.pop() {
            drained.push(task_id);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::new(n)
    }

    #[test]
    fn test_fifo_within_class() {
        let mut queue = TaskQueue::new();
        queue.push(id(1), Priority::Normal);
        queue.push(id(2), Priority::Normal);
        queue.push(id(3), Priority::Normal);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![id(1), id(2), id(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_before_arrival() {
        let mut queue = TaskQueue::new();
        queue.push(id(1), Priority::Low);
        queue.push(id(2), Priority::Normal);
        queue.push(id(3), Priority::High);
        queue.push(id(4), Priority::Normal);

        assert_eq!(queue.pop(), Some(id(3)));
        assert_eq!(queue.pop(), Some(id(2)));
        assert_eq!(queue.pop(), Some(id(4)));
        assert_eq!(queue.pop(), Some(id(1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_retries_jump_ahead_of_normal_work() {
        let mut queue = TaskQueue::new();
        queue.push(id(1), Priority::Normal);
        queue.push(id(2), Priority::Normal);
        queue.push_retry(id(5));
        queue.push_retry(id(6));

        // Retries keep arrival order among themselves
        assert_eq!(queue.drain(), vec![id(5), id(6), id(1), id(2)]);
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        queue.push(id(1), Priority::Normal);
        queue.push(id(2), Priority::High);

        assert!(queue.remove(id(1)));
        assert!(!queue.remove(id(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(id(2)));
    }
}
