//! Memory management.

pub mod heap;

pub use heap::LockedHeap;

/// Hardware page size; virtqueue memory and the legacy PFN register are
/// defined in these units.
pub const PAGE_SIZE: usize = 4096;
