//! PL011 UART console for the QEMU `virt` machine.
//!
//! The UART lives at physical `0x0900_0000`. Only the transmit path is
//! driven: wait for the TX FIFO to drain, then write the data register.
//! Newlines are expanded to CR+LF so serial terminals render sanely.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

/// PL011 base address on QEMU `virt` (see QEMU `hw/arm/virt.c`).
const UART_BASE: usize = 0x0900_0000;

/// Data register offset
const UARTDR: usize = 0x000;
/// Flag register offset
const UARTFR: usize = 0x018;
/// Flag register bit: transmit FIFO full
const UARTFR_TXFF: u32 = 1 << 5;

/// Byte sink over a memory-mapped PL011.
pub struct Pl011Uart {
    base: usize,
}

impl Pl011Uart {
    /// # Safety
    ///
    /// `base` must be the physical address of a PL011 register block that
    /// stays mapped for the lifetime of the value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Write one byte, polling until the TX FIFO has room.
    pub fn put_character(&mut self, byte: u8) {
        // SAFETY: base points at a live PL011 register block (constructor
        // contract); DR/FR are 32-bit registers within it.
        unsafe {
            let fr = (self.base + UARTFR) as *const u32;
            let dr = (self.base + UARTDR) as *mut u32;
            while core::ptr::read_volatile(fr) & UARTFR_TXFF != 0 {}
            core::ptr::write_volatile(dr, byte as u32);
        }
    }

    /// Write a string, expanding `\n` to CR+LF.
    pub fn put_string(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put_character(b'\r');
            }
            self.put_character(byte);
        }
    }
}

impl fmt::Write for Pl011Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_string(s);
        Ok(())
    }
}

lazy_static! {
    /// Global console writer.
    pub static ref CONSOLE: Mutex<Pl011Uart> = {
        // SAFETY: UART_BASE is the PL011 of the `virt` machine, identity
        // mapped for the whole kernel lifetime.
        let uart = unsafe { Pl011Uart::new(UART_BASE) };
        Mutex::new(uart)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    CONSOLE
        .lock()
        .write_fmt(args)
        .expect("Printing to serial failed");
}
