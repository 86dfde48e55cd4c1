//! AArch64 architecture support

pub mod context;

#[cfg(target_os = "none")]
pub mod serial;
