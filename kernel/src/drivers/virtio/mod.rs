//! VirtIO over the legacy MMIO transport.
//!
//! QEMU's `virt` machine exposes virtio devices as memory-mapped register
//! blocks enumerated in the device tree. This driver speaks the legacy
//! (pre-1.0) interface: queue memory is handed to the device as a page
//! frame number and the split-ring layout is fixed (descriptor table and
//! available ring on the first page, used ring on the next page boundary).
//!
//! Only the network device is wired up; the transport and ring code carry
//! no net-specific assumptions.

pub mod mmio;
pub mod net;
pub mod queue;

pub use mmio::{VirtioMmioTransport, DEVICE_ID_NET};
pub use net::VirtioNet;
