//! Run queue: a fixed-capacity ring buffer of runnable tasks.

use core::ptr::NonNull;

use spin::Mutex;

use super::{task::Task, task_ptr::TaskPtr};

/// Maximum number of queued threads. A full queue rejects the enqueue; the
/// caller decides whether that is a dropped spawn (diagnosed once) or a
/// bug.
pub const MAX_THREADS: usize = 16;

/// Circular FIFO of task pointers.
pub struct RunQueue {
    tasks: [Option<TaskPtr>; MAX_THREADS],
    /// Next slot to dequeue
    head: usize,
    /// Next slot to enqueue
    tail: usize,
    count: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            tasks: [None; MAX_THREADS],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == MAX_THREADS
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Append a task; returns false (leaving the queue unchanged) when
    /// full.
    pub fn enqueue(&mut self, task: NonNull<Task>) -> bool {
        if self.is_full() {
            return false;
        }

        self.tasks[self.tail] = Some(TaskPtr::new(task));
        self.tail = (self.tail + 1) % MAX_THREADS;
        self.count += 1;
        true
    }

    /// Remove and return the oldest task.
    pub fn dequeue(&mut self) -> Option<NonNull<Task>> {
        if self.is_empty() {
            return None;
        }

        let task = self.tasks[self.head].take();
        self.head = (self.head + 1) % MAX_THREADS;
        self.count -= 1;
        task.map(|t| t.as_ptr())
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Global run queue serving the single CPU round-robin.
pub static RUN_QUEUE: Mutex<RunQueue> = Mutex::new(RunQueue::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::{boxed::Box, vec::Vec};

    use super::*;

    fn leak_task() -> NonNull<Task> {
        NonNull::from(Box::leak(Box::new(Task::new())))
    }

    #[test]
    fn fifo_order() {
        let mut queue = RunQueue::new();
        let tasks: Vec<_> = (0..3).map(|_| leak_task()).collect();

        for &t in &tasks {
            assert!(queue.enqueue(t));
        }
        assert_eq!(queue.len(), 3);

        for &t in &tasks {
            assert_eq!(queue.dequeue(), Some(t));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut queue = RunQueue::new();

        for _ in 0..MAX_THREADS {
            assert!(queue.enqueue(leak_task()));
        }
        assert!(queue.is_full());

        // The seventeenth thread is refused, the queue untouched.
        assert!(!queue.enqueue(leak_task()));
        assert_eq!(queue.len(), MAX_THREADS);
    }

    #[test]
    fn wraps_around() {
        let mut queue = RunQueue::new();

        // Drive head/tail past the array boundary a few times.
        for round in 0..5 {
            let tasks: Vec<_> = (0..MAX_THREADS).map(|_| leak_task()).collect();
            for &t in &tasks {
                assert!(queue.enqueue(t), "round {}", round);
            }
            for &t in &tasks {
                assert_eq!(queue.dequeue(), Some(t));
            }
        }
        assert!(queue.is_empty());
    }
}
