//! Console byte sink.
//!
//! On the real kernel this is the PL011 UART of the `virt` machine (see
//! [`crate::arch::aarch64::serial`]); on the host it forwards to stdout so
//! test output stays visible.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use crate::arch::aarch64::serial::{Pl011Uart, _print, CONSOLE};

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    std::print!("{}", args);
}
