//! PrismOS kernel binary.
//!
//! Owns the boot entry, the panic policy, and `kernel_main`: print what the
//! allocator got, run the cooperative-threading demo, then bring up
//! virtio-net and poll it forever.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
use alloc::vec::Vec;
#[cfg(target_os = "none")]
use core::{
    panic::PanicInfo,
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(target_os = "none")]
use prism_kernel::{
    arch,
    drivers::{
        fdt,
        virtio::{VirtioNet, DEVICE_ID_NET},
    },
    init, println, sched,
    thread::Thread,
    ALLOCATOR,
};

#[cfg(target_os = "none")]
core::arch::global_asm!(include_str!("arch/aarch64/boot.S"));

#[cfg(target_os = "none")]
#[no_mangle]
unsafe extern "C" fn _start_rust(dtb: *const u8) -> ! {
    // SAFETY: reached exactly once from the boot assembly, with the
    // loader's device-tree pointer still in x0.
    unsafe { init::initialize(dtb) };
    kernel_main();
    arch::halt()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    arch::halt()
}

#[cfg(target_os = "none")]
fn kernel_main() {
    println!("PrismOS v{}", env!("CARGO_PKG_VERSION"));
    println!("Max memory: {} MB", ALLOCATOR.total() / (1024 * 1024));

    // The boot flow becomes the first thread.
    sched::init();

    threading_demo();

    // Network bring-up: first live virtio-net device in the tree.
    match fdt::find_virtio_device(DEVICE_ID_NET) {
        Some(base) => {
            println!("Found network card at {:#x}", base);
            match VirtioNet::init(base) {
                Ok(mut net) => {
                    net.fill_rx();
                    loop {
                        net.poll(&mut |_frame| {
                            // Frames are logged by the driver; nothing
                            // above raw Ethernet runs in this kernel.
                        });
                        sched::yield_now();
                    }
                }
                Err(err) => println!("Network init failed: {}", err),
            }
        }
        None => println!("No network card found."),
    }
}

/// Four threads bump a shared counter five times each, yielding between
/// increments, then the boot thread joins them all.
#[cfg(target_os = "none")]
fn threading_demo() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let mut workers = Vec::new();
    for i in 0..4 {
        workers.push(Thread::spawn(move || {
            for _ in 0..5 {
                COUNTER.fetch_add(1, Ordering::Relaxed);
                println!("Thread {}: Count {}", i, COUNTER.load(Ordering::Relaxed));
                sched::yield_now();
            }
        }));
    }

    println!("All threads spawned. Waiting for completion...");
    for worker in workers.iter_mut() {
        worker.join();
    }
    println!(
        "All threads finished. Counter = {}",
        COUNTER.load(Ordering::Relaxed)
    );
}

// Host builds only exist so `cargo test` can link the workspace; the
// kernel entry above is target-only.
#[cfg(not(target_os = "none"))]
fn main() {}
