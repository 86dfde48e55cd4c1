//! PrismOS kernel library
//!
//! A small cooperative kernel for the QEMU AArch64 `virt` machine: free-list
//! heap over device-tree-discovered RAM, cooperative threads with an explicit
//! context switch, and a polled virtio-net driver on the legacy MMIO
//! transport.
//!
//! The library builds for two worlds:
//!
//! * `aarch64-unknown-none` -- the real kernel, linked into the boot image.
//! * the host target -- pure data-structure logic (allocator, device-tree
//!   scanner, virtqueues, run queue) compiled with `std` so the standard
//!   `#[test]` harness can exercise it.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: link std so unit tests can allocate and print normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod init;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod thread;

/// Global kernel heap. Installed over the device-tree-discovered RAM region
/// during [`init::initialize`]; every `Box`/`Vec` in the kernel lands here.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: mm::heap::LockedHeap = mm::heap::LockedHeap::empty();

// Host target: use the system allocator so unit tests behave normally.
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Heap allocation error handler.
///
/// The free-list allocator already panics on exhaustion, so this only fires
/// for pathological layouts. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
