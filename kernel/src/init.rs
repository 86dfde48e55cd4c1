//! Early kernel initialisation.
//!
//! [`initialize`] is the first Rust code after the boot assembly: it zeroes
//! `.bss`, registers the device-tree blob, brings up logging, sizes RAM,
//! and installs the heap. Only then is `kernel_main` entered.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod imp {
    use core::ptr;

    use crate::{drivers::fdt, logger, ALLOCATOR};

    /// RAM region assumed when the device tree yields nothing: the QEMU
    /// `virt` default of 128 MiB at 1 GiB.
    const FALLBACK_RAM_BASE: u64 = 0x4000_0000;
    const FALLBACK_RAM_SIZE: u64 = 128 * 1024 * 1024;

    extern "C" {
        static __bss_start: u8;
        static __bss_end: u8;
        static _heap_start: u8;
    }

    /// Zero `[__bss_start, __bss_end)`. Must run before anything touches a
    /// zero-initialised static.
    unsafe fn zero_bss() {
        // SAFETY: the linker script guarantees start <= end and that the
        // range is exactly the kernel's .bss.
        unsafe {
            let start = ptr::addr_of!(__bss_start) as *mut u8;
            let end = ptr::addr_of!(__bss_end) as *const u8;
            let len = end as usize - start as usize;
            ptr::write_bytes(start, 0, len);
        }
    }

    /// Wire the kernel together, in dependency order.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the boot path, before any other
    /// kernel code runs. `dtb` is the bootloader-provided device-tree
    /// pointer (may be invalid; RAM discovery then falls back to the QEMU
    /// defaults).
    pub unsafe fn initialize(dtb: *const u8) {
        // SAFETY: first thing after boot, nothing has used .bss yet.
        unsafe { zero_bss() };

        // SAFETY: the bootloader's blob stays mapped forever; validation
        // happens inside.
        unsafe { fdt::init(dtb) };

        logger::init();

        let (ram_base, ram_size) =
            fdt::memory_region().unwrap_or((FALLBACK_RAM_BASE, FALLBACK_RAM_SIZE));

        // The heap runs from the end of the kernel image (plus boot stack)
        // to the end of RAM.
        let heap_start = ptr::addr_of!(_heap_start) as usize;
        let heap_end = (ram_base + ram_size) as usize;
        // SAFETY: the linker places _heap_start past every kernel section;
        // nothing else uses the region up to the end of RAM.
        unsafe { ALLOCATOR.init(heap_start, heap_end) };

        log::info!(
            "heap: {} KB at {:#x}",
            ALLOCATOR.total() / 1024,
            heap_start
        );
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use imp::initialize;
