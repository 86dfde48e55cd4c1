//! Kernel error types.
//!
//! Everything that can fail without being fatal reports one of these
//! variants; fatal conditions (heap exhaustion, misused thread handles) go
//! straight to `panic!` as described in the respective modules.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A device probe or initialisation step read unexpected register
    /// contents (wrong magic value, wrong device id).
    HardwareError { device: &'static str, code: u32 },

    /// The device reports the selected virtqueue as absent
    /// (`QUEUE_NUM_MAX == 0`).
    QueueUnavailable { index: u32 },

    /// A ring (run queue or virtqueue) has no free slot.
    QueueFull,

    /// The device-tree blob failed validation.
    InvalidDeviceTree,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::HardwareError { device, code } => {
                write!(f, "hardware error on {}: {:#x}", device, code)
            }
            KernelError::QueueUnavailable { index } => {
                write!(f, "virtqueue {} unavailable", index)
            }
            KernelError::QueueFull => write!(f, "queue full"),
            KernelError::InvalidDeviceTree => write!(f, "invalid device tree blob"),
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
