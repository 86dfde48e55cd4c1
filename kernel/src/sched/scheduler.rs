//! Core scheduling: current-task tracking, yield, exit, and the reap pass
//! for detached threads.
//!
//! Everything here relies on the cooperative model: between two suspension
//! points exactly one thread touches kernel state, so the only locking is
//! the run-queue mutex (held strictly between suspension points, never
//! across a context switch).

use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use spin::Mutex;

use super::{
    queue::RUN_QUEUE,
    task::{Task, ThreadState},
    task_ptr::TaskPtr,
};

/// Alignment of scheduler-owned thread stacks.
pub const STACK_ALIGN: usize = 16;

/// The task currently on the CPU; null before [`init`] and while idling.
static CURRENT: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());

/// Parking slot for a dead detached task. Its owner cannot free its own
/// stack while still running on it, so it leaves itself here and the next
/// scheduling pass (running on some other stack) releases it.
static REAP_SLOT: Mutex<Option<TaskPtr>> = Mutex::new(None);

/// The task currently on the CPU.
pub fn current() -> Option<NonNull<Task>> {
    NonNull::new(CURRENT.load(Ordering::Relaxed))
}

/// Adopt the boot flow as the initial thread.
///
/// The boot thread already has a stack; the scheduler only needs a TCB to
/// save its registers into when it first yields. Must run before any
/// spawn.
pub fn init() {
    let task = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(Task::boot()));
    CURRENT.store(task, Ordering::Relaxed);
}

/// Initialise `task`'s context for `entry(arg)` and put it on the run
/// queue. A full queue drops the spawn with one diagnostic line.
pub fn spawn(mut task: NonNull<Task>, entry: extern "C" fn(*mut u8), arg: *mut u8) {
    // SAFETY: the caller hands over a live, exclusively-owned TCB.
    unsafe { task.as_mut() }.prepare(task_trampoline, entry, arg);
    enqueue(task);
}

fn enqueue(task: NonNull<Task>) {
    if !RUN_QUEUE.lock().enqueue(task) {
        log::warn!("Scheduler queue full! Dropping thread.");
    }
}

/// Free a task's stack and TCB.
///
/// # Safety
///
/// The task must be `Dead`, out of the run queue, not `CURRENT`, and must
/// have been created by [`crate::thread::Thread::spawn`] (boxed TCB,
/// scheduler-owned stack unless `stack_base` is null).
pub unsafe fn release_task(task: TaskPtr) {
    // SAFETY: exclusive ownership per the function contract.
    let task = unsafe { alloc::boxed::Box::from_raw(task.as_raw()) };
    if !task.stack_base.is_null() {
        // SAFETY: the stack was allocated with exactly this layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(task.stack_size, STACK_ALIGN);
            alloc::alloc::dealloc(task.stack_base, layout);
        }
    }
    drop(task);
}

/// Release a parked dead detached task, unless it is the caller itself
/// (a dying thread passes through here on its way out, still on its own
/// stack).
fn reap_detached() {
    let mut slot = REAP_SLOT.lock();
    if let Some(task) = *slot {
        if task.as_raw() != CURRENT.load(Ordering::Relaxed) {
            *slot = None;
            drop(slot);
            // SAFETY: only exit_thread parks tasks here, always Dead,
            // never enqueued again; the check above excludes the one task
            // that could still be on its stack.
            unsafe { release_task(task) };
        }
    }
}

/// Pick the next runnable thread and switch to it.
///
/// With an empty queue the current thread simply keeps running; if there
/// is no current thread either (the last one died), the CPU parks in a
/// wait-for-event loop. The previous thread is *not* re-queued here --
/// yield does that, exit deliberately does not.
pub fn schedule() {
    reap_detached();

    let next = {
        let mut queue = RUN_QUEUE.lock();
        loop {
            match queue.dequeue() {
                // Skip dead entries that slipped in.
                // SAFETY: queued pointers are live TCBs (spawn/yield
                // invariant).
                Some(task) if unsafe { task.as_ref() }.state == ThreadState::Dead => continue,
                other => break other,
            }
        }
    };

    let Some(mut next) = next else {
        let current = CURRENT.load(Ordering::Relaxed);
        // SAFETY: CURRENT is null or points at a live TCB.
        if !current.is_null() && unsafe { (*current).state } != ThreadState::Dead {
            return; // nothing else to run; keep running
        }

        // The current thread is gone and the queue is empty.
        CURRENT.store(ptr::null_mut(), Ordering::Relaxed);
        println!("System Idle: No runnable threads.");
        loop {
            crate::arch::idle();
        }
    };

    let old = CURRENT.swap(next.as_ptr(), Ordering::Relaxed);
    // SAFETY: next came off the run queue and is not Dead.
    unsafe { next.as_mut() }.state = ThreadState::Running;

    let old_context = if old.is_null() {
        ptr::null_mut()
    } else {
        // SAFETY: old was CURRENT, hence a live TCB. Saving state into a
        // dead TCB on the exit path is harmless; it is released later.
        unsafe { ptr::addr_of_mut!((*old).context) }
    };

    // SAFETY: next's context is either a freshly prepared trampoline frame
    // or state saved by a previous switch; both resume correctly. old
    // outlives the switch (see release rules above).
    unsafe {
        crate::arch::context_switch(old_context, ptr::addr_of!((*next.as_ptr()).context));
    }
}

/// Give up the CPU, keeping the caller runnable (round-robin).
pub fn yield_now() {
    if let Some(mut current) = current() {
        // SAFETY: CURRENT points at a live TCB owned by the running
        // thread.
        unsafe { current.as_mut() }.state = ThreadState::Runnable;
        enqueue(current);
    }
    schedule();
}

/// Terminate the calling thread. Never returns; the stack is released by
/// `join` (joinable threads) or the scheduler's reap pass (detached
/// threads).
pub fn exit_thread() -> ! {
    if let Some(mut current) = current() {
        // SAFETY: CURRENT points at the caller's live TCB.
        let task = unsafe { current.as_mut() };
        task.state = ThreadState::Dead;

        if task.detached {
            // Make room first: any previously parked corpse is not us and
            // can be freed now.
            reap_detached();
            *REAP_SLOT.lock() = Some(TaskPtr::new(current));
        }
    }

    schedule();

    // A dead thread is never switched back to; this quiets the compiler
    // and catches the impossible.
    loop {
        crate::arch::idle();
    }
}

/// First code a fresh thread runs: call the entry function, then die.
pub extern "C" fn task_trampoline(entry: extern "C" fn(*mut u8), arg: *mut u8) -> ! {
    entry(arg);
    exit_thread()
}
