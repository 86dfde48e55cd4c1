//! Safe wrapper for task pointers.

use core::ptr::NonNull;

use super::task::Task;

/// A wrapper around `NonNull<Task>` that implements Send and Sync.
///
/// # Safety
///
/// This is sound because tasks are only touched by the single cooperative
/// CPU, never across a suspension point, and their memory is released only
/// through `join` or the scheduler's reap pass -- both of which run after
/// the task can no longer be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

impl TaskPtr {
    pub fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> NonNull<Task> {
        self.0
    }

    pub fn as_raw(&self) -> *mut Task {
        self.0.as_ptr()
    }
}

// SAFETY: see the type-level safety note.
unsafe impl Send for TaskPtr {}
// SAFETY: see the type-level safety note.
unsafe impl Sync for TaskPtr {}

impl From<NonNull<Task>> for TaskPtr {
    fn from(ptr: NonNull<Task>) -> Self {
        Self::new(ptr)
    }
}
