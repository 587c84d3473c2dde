//! Priority queue of task ids.
//!
//! Ordering is `(priority desc, created_at asc, seq asc)`: higher priority
//! first, FIFO within a priority band. `seq` is the arrival counter and breaks
//! ties between tasks created in the same instant.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::domain::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the "greatest" entry pops first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: i32, created_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority,
            created_at,
            seq,
            task_id,
        });
    }

    /// Pop the highest-ordered task for which `ready` returns true.
    ///
    /// Entries skipped on the way (e.g. tasks still backing off) keep their
    /// position.
    pub fn pop_ready<F>(&mut self, mut ready: F) -> Option<TaskId>
    where
        F: FnMut(TaskId) -> bool,
    {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = self.heap.pop() {
            if ready(entry.task_id) {
                found = Some(entry.task_id);
                break;
            }
            deferred.push(entry);
        }

        self.heap.extend(deferred);
        found
    }

    /// Remove a task; returns whether it was queued
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.task_id != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.heap.iter().any(|e| e.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Task ids in dispatch order (ignoring readiness)
    pub fn ordered_ids(&self) -> Vec<TaskId> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.task_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_higher_priority_first() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let (low, high, mid) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        queue.push(low, 1, now);
        queue.push(high, 9, now);
        queue.push(mid, 3, now);

        assert_eq!(queue.pop_ready(|_| true), Some(high));
        assert_eq!(queue.pop_ready(|_| true), Some(mid));
        assert_eq!(queue.pop_ready(|_| true), Some(low));
        assert_eq!(queue.pop_ready(|_| true), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let ids: Vec<TaskId> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(*id, 5, now);
        }

        assert_eq!(queue.ordered_ids(), ids);
        for id in &ids {
            assert_eq!(queue.pop_ready(|_| true), Some(*id));
        }
    }

    #[test]
    fn test_older_task_wins_tie() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let (newer, older) = (Uuid::new_v4(), Uuid::new_v4());

        queue.push(newer, 5, now);
        queue.push(older, 5, now - chrono::Duration::seconds(1));

        assert_eq!(queue.pop_ready(|_| true), Some(older));
    }

    #[test]
    fn test_pop_ready_skips_without_losing_entries() {
        let now = Utc::now();
        let mut queue = TaskQueue::new();
        let (waiting, ready) = (Uuid::new_v4(), Uuid::new_v4());

        queue.push(waiting, 9, now);
        queue.push(ready, 1, now);

        assert_eq!(queue.pop_ready(|id| id == ready), Some(ready));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(waiting));
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        let id = Uuid::new_v4();
        queue.push(id, 1, Utc::now());

        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.is_empty());
    }
}
