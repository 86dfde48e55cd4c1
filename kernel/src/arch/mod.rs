//! Architecture support.
//!
//! The kernel targets AArch64 only; the handful of host-side fallbacks in
//! here exist so the portable subsystems (allocator, scanner, queues) can be
//! unit-tested with the standard harness.

pub mod barriers;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::context::context_switch;

/// Host stub for [`context_switch`]; the portable scheduler logic is
/// testable, the actual stack switch is not.
///
/// # Safety
///
/// Never to be called; present only so host builds type-check.
#[cfg(not(target_arch = "aarch64"))]
pub unsafe fn context_switch(
    _old: *mut crate::sched::task::ThreadContext,
    _new: *const crate::sched::task::ThreadContext,
) {
    unimplemented!("context switching is only available on the AArch64 target");
}

/// Halt the calling CPU forever.
pub fn halt() -> ! {
    loop {
        idle();
    }
}

/// Park the CPU until the next event.
#[cfg(target_arch = "aarch64")]
pub fn idle() {
    cortex_a::asm::wfe();
}

#[cfg(not(target_arch = "aarch64"))]
pub fn idle() {
    core::hint::spin_loop();
}
