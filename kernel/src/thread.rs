//! High-level thread handle.
//!
//! [`Thread::spawn`] wraps the scheduler's raw TCB machinery: it allocates
//! the control block and a 64 KiB stack on the heap, moves the caller's
//! closure onto the heap, and enqueues the thread. The handle is move-only
//! and must be consumed by [`join`](Thread::join) or
//! [`detach`](Thread::detach); dropping a joinable handle is a programming
//! error and panics, matching the std semantics.

use alloc::boxed::Box;
use core::{alloc::Layout, ptr::NonNull};

use crate::sched::{self, Task, TaskPtr, ThreadState};

/// Stack size for spawned threads.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Owning handle to a spawned thread.
pub struct Thread {
    handle: Option<TaskPtr>,
}

impl Thread {
    /// Spawn a new thread running `f`.
    ///
    /// Panics (via the allocator) if the kernel heap cannot supply the TCB,
    /// stack, or closure storage. If the run queue is full the thread never
    /// runs -- the scheduler logs the drop -- but the handle is still
    /// returned and must still be detached or joined.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Box::new(Task::new());
        // SAFETY: DEFAULT_STACK_SIZE is non-zero and STACK_ALIGN a power
        // of two.
        let stack = unsafe {
            let layout =
                Layout::from_size_align_unchecked(DEFAULT_STACK_SIZE, sched::scheduler::STACK_ALIGN);
            alloc::alloc::alloc(layout)
        };
        task.stack_base = stack;
        task.stack_size = DEFAULT_STACK_SIZE;

        // Move the closure to the heap so it survives this scope; the
        // entry shim below reboxes and consumes it.
        let payload = Box::into_raw(Box::new(f));

        let task = NonNull::from(Box::leak(task));
        sched::spawn(task, thread_entry::<F>, payload.cast());

        Self {
            handle: Some(TaskPtr::new(task)),
        }
    }

    /// Wait (by yielding) until the thread has finished, then release its
    /// TCB and stack. No-op on an empty handle.
    pub fn join(&mut self) {
        let Some(task) = self.handle.take() else {
            return;
        };

        // SAFETY: the handle owns the TCB; it stays allocated until we
        // release it below, and Dead is only ever set by the thread itself
        // on its way out.
        while unsafe { (*task.as_raw()).state } != ThreadState::Dead {
            sched::yield_now();
        }

        // SAFETY: the thread is Dead and fully switched away (we are
        // running, it is not), never re-enqueued, and was created by
        // spawn above.
        unsafe { sched::scheduler::release_task(task) };
    }

    /// Give up ownership; the scheduler reaps the TCB and stack after the
    /// thread finishes. No-op on an empty handle.
    pub fn detach(&mut self) {
        let Some(task) = self.handle.take() else {
            return;
        };

        // SAFETY: the TCB is live (the handle owned it until now).
        let already_dead = unsafe {
            let task = &mut *task.as_raw();
            task.detached = true;
            task.state == ThreadState::Dead
        };

        if already_dead {
            // Finished before the detach: nothing will ever schedule it
            // again, so it can be released right here.
            // SAFETY: Dead, switched away, not queued, spawned by us.
            unsafe { sched::scheduler::release_task(task) };
        }
    }

    /// Whether the handle still owns a thread.
    pub fn is_joinable(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            panic!("thread destroyed while joinable!");
        }
    }
}

/// Monomorphised entry shim: rebox the closure and run it. The trampoline
/// in the scheduler handles thread death when this returns.
extern "C" fn thread_entry<F>(arg: *mut u8)
where
    F: FnOnce() + Send + 'static,
{
    // SAFETY: arg is the Box<F> leaked by Thread::spawn for exactly this
    // call.
    let f = unsafe { Box::from_raw(arg.cast::<F>()) };
    f();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The threads spawned here never run (context switching needs the real
    // target), but handle lifecycle and TCB setup are host-checkable.

    #[test]
    fn spawned_handle_is_joinable() {
        let mut thread = Thread::spawn(|| {});
        assert!(thread.is_joinable());

        let task = thread.handle.expect("handle must own a task");
        let state = unsafe { (*task.as_raw()).state };
        assert_eq!(state, ThreadState::Runnable);
        let sp = unsafe { (*task.as_raw()).context.sp };
        assert_eq!(sp % 16, 0);

        thread.detach();
        assert!(!thread.is_joinable());
    }

    #[test]
    fn detach_clears_the_handle() {
        let mut thread = Thread::spawn(|| {});
        thread.detach();
        assert!(!thread.is_joinable());
        // Second detach is a no-op.
        thread.detach();
    }

    #[test]
    #[should_panic(expected = "destroyed while joinable")]
    fn dropping_a_joinable_handle_panics() {
        let _thread = Thread::spawn(|| {});
        // Dropped here without join or detach.
    }
}
