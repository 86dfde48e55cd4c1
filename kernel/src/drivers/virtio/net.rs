//! Virtio network device driver (legacy MMIO, polled).
//!
//! Queue 0 receives, queue 1 transmits. Every frame on the wire is
//! preceded by a 10-byte virtio-net header that this driver zeroes on
//! transmit and skips on receive; no offloads are negotiated, so the
//! header content is never interesting.
//!
//! There are no interrupts anywhere in this kernel: [`VirtioNet::poll`]
//! drains the RX used ring, recycles the buffers back to the device, and
//! reclaims completed TX buffers.

use core::{alloc::Layout, mem, ptr};

use super::{
    mmio::{DeviceStatus, VirtioMmioTransport, DEVICE_ID_NET, MMIO_MAGIC},
    queue::{VirtQueue, QUEUE_SIZE, VIRTQ_DESC_F_WRITE},
};
use crate::{
    arch::barriers::data_sync_barrier,
    error::{KernelError, KernelResult},
    mm::PAGE_SIZE,
};

/// Receive buffer size: MTU 1500 plus the virtio-net header, rounded up
/// generously to a power of two.
pub const RX_BUFFER_SIZE: usize = 2048;

/// Header prepended to every frame on both rings.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

const NET_HDR_SIZE: usize = mem::size_of::<VirtioNetHdr>();

/// A transmit buffer lent to the device, remembered so it can be freed
/// once the device reports the descriptor in the TX used ring.
struct TxBuffer {
    ptr: *mut u8,
    layout: Layout,
}

/// Driver state for one virtio-net device.
pub struct VirtioNet {
    transport: VirtioMmioTransport,
    rx: VirtQueue,
    tx: VirtQueue,
    /// Round-robin cursor over the TX descriptor table
    tx_next: u16,
    /// In-flight TX buffers, indexed by descriptor
    tx_pending: [Option<TxBuffer>; QUEUE_SIZE],
    rx_filled: bool,
}

// SAFETY: all raw pointers are buffers owned by this driver; access is
// serialized by the single cooperative CPU and the owner's lock.
unsafe impl Send for VirtioNet {}

impl VirtioNet {
    /// Bring the device at `base` up to DRIVER_OK with both queues
    /// configured.
    ///
    /// Wrong magic or a non-net device id aborts with a diagnostic, as does
    /// a missing queue. Feature negotiation is skipped; the legacy defaults
    /// are accepted as-is, which is sufficient for QEMU's model.
    pub fn init(base: u64) -> KernelResult<Self> {
        // SAFETY: base comes from the device tree, which maps it to a
        // virtio-mmio register block that stays valid forever.
        let transport = unsafe { VirtioMmioTransport::new(base as usize) };

        let magic = transport.magic();
        if magic != MMIO_MAGIC {
            log::error!("virtio-net: bad magic value {:#x} at {:#x}", magic, base);
            return Err(KernelError::HardwareError {
                device: "virtio-net",
                code: magic,
            });
        }

        let device_id = transport.device_id();
        if device_id != DEVICE_ID_NET {
            log::error!("virtio-net: device id {} is not a network card", device_id);
            return Err(KernelError::HardwareError {
                device: "virtio-net",
                code: device_id,
            });
        }

        transport.reset();
        transport.set_status(DeviceStatus::ACKNOWLEDGE);
        transport.set_status(DeviceStatus::DRIVER);

        // Feature negotiation skipped: defaults accepted.

        let rx = Self::setup_queue(&transport, 0)?;
        let tx = Self::setup_queue(&transport, 1)?;

        transport.set_status(DeviceStatus::DRIVER_OK);
        log::info!("virtio-net: initialised at {:#x}", base);

        Ok(Self {
            transport,
            rx,
            tx,
            tx_next: 0,
            tx_pending: [const { None }; QUEUE_SIZE],
            rx_filled: false,
        })
    }

    /// Configure one queue: select it, confirm it exists, then hand the
    /// device the ring memory as a page frame number.
    fn setup_queue(transport: &VirtioMmioTransport, index: u32) -> KernelResult<VirtQueue> {
        transport.select_queue(index);

        let max_size = transport.queue_num_max();
        if max_size == 0 {
            log::warn!("virtio-net: queue {} unavailable", index);
            return Err(KernelError::QueueUnavailable { index });
        }

        transport.set_queue_num(QUEUE_SIZE as u32);
        transport.set_queue_align(PAGE_SIZE as u32);

        let queue = VirtQueue::new(index);
        transport.set_queue_pfn(queue.pfn());
        data_sync_barrier();

        Ok(queue)
    }

    /// Hand the device a full ring of empty receive buffers and notify it.
    pub fn fill_rx(&mut self) {
        // SAFETY: size 2048, align 16: valid layout.
        let layout = unsafe { Layout::from_size_align_unchecked(RX_BUFFER_SIZE, 16) };

        for i in 0..QUEUE_SIZE as u16 {
            // SAFETY: layout is non-zero-sized; exhaustion panics inside
            // the allocator.
            let buffer = unsafe { alloc::alloc::alloc(layout) };
            // SAFETY: buffer is RX_BUFFER_SIZE bytes and lives until the
            // driver is dropped; the device owns it between publish and
            // used-ring completion.
            unsafe {
                self.rx.write_desc(
                    i,
                    buffer as u64,
                    RX_BUFFER_SIZE as u32,
                    VIRTQ_DESC_F_WRITE,
                    0,
                );
            }
            self.rx.stage_avail(i, i);
        }

        self.rx.publish_avail_idx(QUEUE_SIZE as u16);
        self.transport.notify(self.rx.index());
        self.rx_filled = true;
    }

    /// Queue one Ethernet frame for transmission.
    ///
    /// The frame is copied behind a zeroed virtio-net header into a fresh
    /// buffer, which is reclaimed once the device posts the descriptor in
    /// the TX used ring. Fails with [`KernelError::QueueFull`] when all 16
    /// descriptors are still in flight.
    pub fn send(&mut self, frame: &[u8]) -> KernelResult<()> {
        self.reclaim_tx();

        let desc_index = self.tx_next;
        if self.tx_pending[desc_index as usize].is_some() {
            log::warn!("virtio-net: TX ring full, dropping frame");
            return Err(KernelError::QueueFull);
        }
        self.tx_next = (self.tx_next + 1) % QUEUE_SIZE as u16;

        let total_len = NET_HDR_SIZE + frame.len();
        // SAFETY: align 16 is a valid power of two; total_len is bounded by
        // the caller's frame size.
        let layout = unsafe { Layout::from_size_align_unchecked(total_len, 16) };
        // SAFETY: layout is non-zero-sized (header is 10 bytes).
        let buffer = unsafe { alloc::alloc::alloc(layout) };

        // SAFETY: buffer is total_len bytes; header prefix and payload do
        // not overlap the source slice.
        unsafe {
            ptr::write_bytes(buffer, 0, NET_HDR_SIZE);
            ptr::copy_nonoverlapping(frame.as_ptr(), buffer.add(NET_HDR_SIZE), frame.len());
        }

        // SAFETY: buffer stays allocated until reclaim_tx sees the
        // completion for this descriptor.
        unsafe {
            self.tx
                .write_desc(desc_index, buffer as u64, total_len as u32, 0, 0);
        }
        self.tx.push_avail(desc_index);
        self.transport.notify(self.tx.index());

        self.tx_pending[desc_index as usize] = Some(TxBuffer {
            ptr: buffer,
            layout,
        });

        Ok(())
    }

    /// Free TX buffers the device has finished with.
    fn reclaim_tx(&mut self) {
        while let Some(elem) = self.tx.poll_used() {
            let index = elem.id as usize;
            if index >= QUEUE_SIZE {
                continue;
            }
            if let Some(buffer) = self.tx_pending[index].take() {
                // SAFETY: the buffer was allocated with this layout in
                // send() and the device is done with it.
                unsafe { alloc::alloc::dealloc(buffer.ptr, buffer.layout) };
            }
        }
    }

    /// Drain the RX used ring, handing each received Ethernet frame (header
    /// stripped) to `on_frame` and recycling the buffer to the device.
    /// Also reclaims completed TX buffers. Returns the number of frames
    /// delivered.
    pub fn poll(&mut self, on_frame: &mut dyn FnMut(&[u8])) -> usize {
        self.reclaim_tx();

        let mut received = 0;
        while let Some(elem) = self.rx.poll_used() {
            let head = (elem.id as usize % QUEUE_SIZE) as u16;
            let buffer = self.rx.desc_addr(head) as *const u8;

            if (elem.len as usize) >= NET_HDR_SIZE {
                let frame_len = elem.len as usize - NET_HDR_SIZE;
                // SAFETY: the device wrote elem.len bytes into this 2048-byte
                // buffer; the frame follows the header prefix.
                let frame =
                    unsafe { core::slice::from_raw_parts(buffer.add(NET_HDR_SIZE), frame_len) };

                println!("RX Packet: {} bytes", frame_len);
                if frame.len() >= 6 {
                    println!(
                        "  Dst MAC: {:02x}:{:02x}:{:02x}:...",
                        frame[0], frame[1], frame[2]
                    );
                }

                on_frame(frame);
                received += 1;
            }

            // Recycle the buffer: the descriptor still points at it, so
            // publishing the head again re-arms it for the device.
            self.rx.push_avail(head);
        }

        received
    }

    /// Number of TX buffers still lent to the device.
    pub fn tx_in_flight(&self) -> usize {
        self.tx_pending.iter().filter(|b| b.is_some()).count()
    }

    /// Driver's position in the RX used ring (for tests and diagnostics).
    pub fn rx_last_used(&self) -> u16 {
        self.rx.last_used_idx()
    }
}

impl Drop for VirtioNet {
    fn drop(&mut self) {
        // SAFETY: RX descriptors hold the 2048-byte buffers installed by
        // fill_rx; recycling reuses the same buffers, so each is freed
        // exactly once here.
        if self.rx_filled {
            let layout = unsafe { Layout::from_size_align_unchecked(RX_BUFFER_SIZE, 16) };
            for i in 0..QUEUE_SIZE as u16 {
                let addr = self.rx.desc_addr(i) as *mut u8;
                if !addr.is_null() {
                    // SAFETY: see above.
                    unsafe { alloc::alloc::dealloc(addr, layout) };
                }
            }
        }

        for buffer in self.tx_pending.iter_mut() {
            if let Some(buffer) = buffer.take() {
                // SAFETY: allocated in send() with the stored layout.
                unsafe { alloc::alloc::dealloc(buffer.ptr, buffer.layout) };
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Mock register block with RAM semantics: reads return the last
    /// write, which matches how the status/queue registers are exercised
    /// during legacy initialisation.
    #[repr(C)]
    struct MockRegs {
        words: [u32; 32],
    }

    impl MockRegs {
        fn new() -> Box<MockRegs> {
            let mut words = [0u32; 32];
            words[0x000 / 4] = MMIO_MAGIC;
            words[0x004 / 4] = 1; // legacy version
            words[0x008 / 4] = DEVICE_ID_NET;
            words[0x00c / 4] = 0x554d_4551; // "QEMU"
            words[0x034 / 4] = 256; // QUEUE_NUM_MAX
            words[0x050 / 4] = 0xffff_ffff; // notify sentinel
            Box::new(MockRegs { words })
        }

        fn base(&self) -> u64 {
            self.words.as_ptr() as u64
        }

        fn word(&self, offset: usize) -> u32 {
            self.words[offset / 4]
        }
    }

    use std::boxed::Box;

    #[test]
    fn init_walks_the_status_protocol() {
        let regs = MockRegs::new();
        let net = VirtioNet::init(regs.base()).unwrap();

        // ACKNOWLEDGE | DRIVER | DRIVER_OK
        assert_eq!(regs.word(0x070), 7);
        assert_eq!(regs.word(0x038), 16); // QUEUE_NUM
        assert_eq!(regs.word(0x03c), 4096); // QUEUE_ALIGN
        assert_ne!(regs.word(0x040), 0); // QUEUE_PFN handed over
        assert_eq!(regs.word(0x040), net.tx.pfn()); // last queue configured
    }

    #[test]
    fn init_rejects_bad_magic() {
        let mut regs = MockRegs::new();
        regs.words[0] = 0xbad;
        assert_eq!(
            VirtioNet::init(regs.base()).err(),
            Some(KernelError::HardwareError {
                device: "virtio-net",
                code: 0xbad,
            })
        );
    }

    #[test]
    fn init_rejects_non_net_device() {
        let mut regs = MockRegs::new();
        regs.words[0x008 / 4] = 2; // block device
        assert!(VirtioNet::init(regs.base()).is_err());
    }

    #[test]
    fn init_rejects_missing_queue() {
        let mut regs = MockRegs::new();
        regs.words[0x034 / 4] = 0;
        assert_eq!(
            VirtioNet::init(regs.base()).err(),
            Some(KernelError::QueueUnavailable { index: 0 })
        );
    }

    #[test]
    fn fill_rx_primes_every_descriptor() {
        let regs = MockRegs::new();
        let mut net = VirtioNet::init(regs.base()).unwrap();
        net.fill_rx();

        assert_eq!(net.rx.avail_idx(), 16);
        for i in 0..16u16 {
            let desc = net.rx.desc_at(i);
            assert_ne!(desc.addr, 0);
            assert_eq!(desc.len, RX_BUFFER_SIZE as u32);
            assert_eq!(desc.flags, VIRTQ_DESC_F_WRITE);
            assert_eq!(net.rx.avail_entry(i), i);
        }
        // Doorbell rung for queue 0.
        assert_eq!(regs.word(0x050), 0);
    }

    #[test]
    fn send_publishes_and_reclaims() {
        let regs = MockRegs::new();
        let mut net = VirtioNet::init(regs.base()).unwrap();

        let frame = [0xaau8; 60];
        net.send(&frame).unwrap();

        assert_eq!(net.tx.avail_idx(), 1);
        assert_eq!(regs.word(0x050), 1); // doorbell for queue 1
        let desc = net.tx.desc_at(0);
        assert_eq!(desc.len, (NET_HDR_SIZE + 60) as u32);
        assert_eq!(desc.flags, 0);
        assert_eq!(net.tx_in_flight(), 1);

        // Header is zeroed, payload copied behind it.
        let buffer = desc.addr as *const u8;
        let sent = unsafe { core::slice::from_raw_parts(buffer, NET_HDR_SIZE + 60) };
        assert!(sent[..NET_HDR_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&sent[NET_HDR_SIZE..], &frame[..]);

        // Device completes the descriptor; the next send reclaims it.
        net.tx.device_complete(0, 0);
        net.send(&frame).unwrap();
        assert_eq!(net.tx_in_flight(), 1);
    }

    #[test]
    fn tx_ring_exhaustion_is_surfaced() {
        let regs = MockRegs::new();
        let mut net = VirtioNet::init(regs.base()).unwrap();

        for _ in 0..16 {
            net.send(&[0u8; 20]).unwrap();
        }
        assert_eq!(net.send(&[0u8; 20]), Err(KernelError::QueueFull));

        // Once the device catches up, transmission resumes.
        net.tx.device_complete(0, 0);
        net.send(&[0u8; 20]).unwrap();
    }

    #[test]
    fn poll_delivers_and_recycles() {
        let regs = MockRegs::new();
        let mut net = VirtioNet::init(regs.base()).unwrap();
        net.fill_rx();

        // Mock device: fill two RX buffers and complete their heads, out
        // of descriptor order.
        for (head, payload_len) in [(5u32, 60usize), (2, 42)] {
            let buffer = net.rx.desc_addr(head as u16) as *mut u8;
            unsafe {
                ptr::write_bytes(buffer, 0, NET_HDR_SIZE);
                for off in 0..payload_len {
                    *buffer.add(NET_HDR_SIZE + off) = head as u8;
                }
            }
            net.rx.device_complete(head, (NET_HDR_SIZE + payload_len) as u32);
        }

        let mut lengths = std::vec::Vec::new();
        let received = net.poll(&mut |frame| lengths.push(frame.len()));

        assert_eq!(received, 2);
        assert_eq!(lengths, [60, 42]);
        assert_eq!(net.rx_last_used(), 2);
        // Both heads recycled back to the device, in completion order.
        assert_eq!(net.rx.avail_idx(), 18);
        assert_eq!(net.rx.avail_entry(16), 5);
        assert_eq!(net.rx.avail_entry(17), 2);
    }

    #[test]
    fn short_rx_completion_is_recycled_without_delivery() {
        let regs = MockRegs::new();
        let mut net = VirtioNet::init(regs.base()).unwrap();
        net.fill_rx();

        net.rx.device_complete(3, 4); // shorter than the net header
        let received = net.poll(&mut |_| panic!("no frame expected"));

        assert_eq!(received, 0);
        assert_eq!(net.rx.avail_idx(), 17);
        assert_eq!(net.rx.avail_entry(16), 3);
    }
}
