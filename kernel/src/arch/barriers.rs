//! Memory barrier primitives.
//!
//! Centralizes barrier operations so the driver code does not carry
//! scattered inline assembly. The virtqueue publish protocol in
//! [`crate::drivers::virtio`] calls [`memory_barrier`] on every edge where
//! the device must observe ring contents before an index or doorbell write.

/// Full data memory barrier -- all memory accesses issued before this
/// barrier are observable by the device before any access issued after it.
///
/// * **AArch64**: `dmb sy` -- full-system data memory barrier.
/// * **host**: `core::sync::atomic::fence(SeqCst)`, which is sufficient for
///   the mock devices used in unit tests.
#[inline(always)]
pub fn memory_barrier() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `dmb sy` only orders memory accesses; it has no other
        // architectural side effects.
        unsafe {
            core::arch::asm!("dmb sy", options(nostack, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Data synchronization barrier with instruction synchronization.
///
/// Used after reconfiguring a device (e.g. handing a queue's page frame
/// number to the transport) where the write must complete before the CPU
/// proceeds, not merely be ordered.
#[inline(always)]
pub fn data_sync_barrier() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `dsb sy` waits for completion of prior accesses; `isb`
        // flushes the pipeline. Standard AArch64 barrier pair.
        unsafe {
            core::arch::asm!("dsb sy", "isb", options(nostack, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
