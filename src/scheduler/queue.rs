use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use crate::core::config::SchedulingPolicy;
use crate::core::errors::{Result, TaskError};
use crate::task::{Task, TaskId};

/// Heap position of a queued task. Greater entries pop first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: (i32, Reverse<DateTime<Utc>>, Reverse<u64>),
    task_id: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue of tasks with an id index.
///
/// Removal by id only drops the index entry; the stale heap entry is skipped
/// when it surfaces and the heap is compacted once stale entries dominate.
/// A sequence number stamped on every push identifies the live entry and
/// breaks ties between tasks created at the same instant.
#[derive(Debug)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
    index: HashMap<TaskId, (u64, Task)>,
    capacity: usize,
    policy: SchedulingPolicy,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize, policy: SchedulingPolicy) -> Self {
        Self {
            heap: BinaryHeap::new(),
            index: HashMap::new(),
            capacity,
            policy,
            next_seq: 0,
        }
    }

    fn entry(&self, seq: u64, task: &Task) -> Entry {
        let rank = match self.policy {
            SchedulingPolicy::PriorityFirst => task.priority(),
            SchedulingPolicy::Fifo => 0,
        };
        Entry {
            key: (rank, Reverse(task.created_at), Reverse(seq)),
            task_id: task.id.clone(),
        }
    }

    /// Add a task. Fails when full or when the id is already queued.
    pub fn push(&mut self, task: Task) -> Result<()> {
        if self.index.len() >= self.capacity {
            return Err(TaskError::QueueFull {
                capacity: self.capacity,
            });
        }
        if self.index.contains_key(&task.id) {
            return Err(TaskError::TaskAlreadyQueued {
                task_id: task.id.clone(),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(seq, task);
        Ok(())
    }

    /// Put back a task taken with [`pop_entry`](Self::pop_entry), keeping its
    /// original position. Capacity is not checked.
    pub fn restore(&mut self, seq: u64, task: Task) {
        if self.index.contains_key(&task.id) {
            return;
        }
        self.insert(seq, task);
    }

    fn insert(&mut self, seq: u64, task: Task) {
        let entry = self.entry(seq, &task);
        self.heap.push(entry);
        self.index.insert(task.id.clone(), (seq, task));
    }

    /// Remove and return the next task with its sequence number
    pub fn pop_entry(&mut self) -> Option<(u64, Task)> {
        while let Some(entry) = self.heap.pop() {
            let Reverse(seq) = entry.key.2;
            let live = matches!(self.index.get(&entry.task_id), Some((s, _)) if *s == seq);
            if live {
                return self.index.remove(&entry.task_id);
            }
        }
        None
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.pop_entry().map(|(_, task)| task)
    }

    pub fn peek(&mut self) -> Option<&Task> {
        loop {
            let entry = self.heap.peek()?;
            let Reverse(seq) = entry.key.2;
            let live = matches!(self.index.get(&entry.task_id), Some((s, _)) if *s == seq);
            if live {
                break;
            }
            self.heap.pop();
        }
        let id = &self.heap.peek()?.task_id;
        self.index.get(id).map(|(_, task)| task)
    }

    /// Remove a queued task by id
    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        let (_, task) = self.index.remove(task_id)?;
        if self.heap.len() > 2 * self.index.len() + 16 {
            self.compact();
        }
        Some(task)
    }

    fn compact(&mut self) {
        let index = &self.index;
        self.heap.retain(|entry| {
            let Reverse(seq) = entry.key.2;
            matches!(index.get(&entry.task_id), Some((s, _)) if *s == seq)
        });
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.index.get(task_id).map(|(_, task)| task)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Queued tasks in dispatch order
    pub fn snapshot(&self) -> Vec<Task> {
        let mut entries: Vec<(Entry, &Task)> = self
            .index
            .values()
            .map(|(seq, task)| (self.entry(*seq, task), task))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, task)| task.clone()).collect()
    }

    /// Drop every queued task, returning them
    pub fn clear(&mut self) -> Vec<Task> {
        self.heap.clear();
        self.index.drain().map(|(_, (_, task))| task).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Payload;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn task(id: &str, priority: i32) -> Task {
        Task::new("agent", "echo", id, Payload::new())
            .with_id(id)
            .with_priority(priority)
    }

    fn drain(queue: &mut TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop()).map(|t| t.id).collect()
    }

    #[test]
    fn test_basic_operations() {
        let mut queue = TaskQueue::new(3, SchedulingPolicy::PriorityFirst);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());

        queue.push(task("a", 5)).unwrap();
        queue.push(task("b", 5)).unwrap();
        queue.push(task("c", 5)).unwrap();
        assert_eq!(queue.len(), 3);
        assert!(queue.is_full());

        let err = queue.push(task("d", 5)).unwrap_err();
        assert!(matches!(err, TaskError::QueueFull { capacity: 3 }));

        assert_eq!(queue.pop().unwrap().id, "a");
        queue.push(task("d", 5)).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.clear().len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut queue = TaskQueue::new(10, SchedulingPolicy::PriorityFirst);
        queue.push(task("a", 5)).unwrap();
        let err = queue.push(task("a", 9)).unwrap_err();
        assert!(matches!(err, TaskError::TaskAlreadyQueued { .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_priority_order() {
        let mut queue = TaskQueue::new(10, SchedulingPolicy::PriorityFirst);
        queue.push(task("low", 1)).unwrap();
        queue.push(task("high", 9)).unwrap();
        queue.push(task("mid", 5)).unwrap();

        assert_eq!(queue.peek().unwrap().id, "high");
        assert_eq!(drain(&mut queue), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_fifo_tie_break() {
        let now = Utc::now();
        let mut later = task("later", 5);
        later.created_at = now;
        let mut earlier = task("earlier", 5);
        earlier.created_at = now - ChronoDuration::seconds(1);

        let mut queue = TaskQueue::new(10, SchedulingPolicy::PriorityFirst);
        queue.push(later).unwrap();
        queue.push(earlier).unwrap();
        assert_eq!(drain(&mut queue), vec!["earlier", "later"]);
    }

    #[test]
    fn test_fifo_policy_ignores_priority() {
        let now = Utc::now();
        let mut first = task("first", 1);
        first.created_at = now - ChronoDuration::seconds(2);
        let mut second = task("second", 10);
        second.created_at = now;

        let mut queue = TaskQueue::new(10, SchedulingPolicy::Fifo);
        queue.push(second).unwrap();
        queue.push(first).unwrap();
        assert_eq!(drain(&mut queue), vec!["first", "second"]);
    }

    #[test]
    fn test_remove_and_restore() {
        let mut queue = TaskQueue::new(10, SchedulingPolicy::PriorityFirst);
        queue.push(task("a", 9)).unwrap();
        queue.push(task("b", 5)).unwrap();
        queue.push(task("c", 1)).unwrap();

        assert_eq!(queue.remove("b").unwrap().id, "b");
        assert!(queue.remove("b").is_none());
        assert!(!queue.contains("b"));

        // re-queueing a removed id gets a fresh entry; the stale one is skipped
        queue.push(task("b", 5)).unwrap();

        let (seq, top) = queue.pop_entry().unwrap();
        assert_eq!(top.id, "a");
        queue.restore(seq, top);
        assert_eq!(drain(&mut queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_compaction_keeps_order() {
        let mut queue = TaskQueue::new(200, SchedulingPolicy::PriorityFirst);
        for i in 0..100 {
            queue.push(task(&format!("t{}", i), i % 10)).unwrap();
        }
        for i in 0..100 {
            if i % 10 != 9 {
                queue.remove(&format!("t{}", i));
            }
        }
        assert_eq!(queue.len(), 10);
        assert!(queue.heap.len() < 100);

        let order = drain(&mut queue);
        assert_eq!(order.len(), 10);
        assert_eq!(order[0], "t9");
        assert_eq!(order[9], "t99");
    }

    #[test]
    fn test_snapshot_in_dispatch_order() {
        let mut queue = TaskQueue::new(10, SchedulingPolicy::PriorityFirst);
        queue.push(task("low", 1)).unwrap();
        queue.push(task("high", 8)).unwrap();

        let ids: Vec<String> = queue.snapshot().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert_eq!(queue.len(), 2);
        assert!(queue.get("low").is_some());
    }
}
