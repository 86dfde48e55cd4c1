//! Flattened device tree (DTB) scanner.
//!
//! The bootloader hands the kernel a pointer to a DTB in `x0`. Everything in
//! the blob is big-endian: a fixed header, then a token stream describing
//! nodes and properties, with property names interned in a separate strings
//! block.
//!
//! Rather than a callback walk, [`DeviceTree::properties`] exposes the token
//! stream as an iterator of `(node, name, data)` records; the two queries
//! the kernel needs -- the first RAM region and a live virtio device -- are
//! filters over that iterator.

use core::{marker::PhantomData, ptr, str};

use spin::Once;

use crate::error::{KernelError, KernelResult};

const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Header word indices (32-bit big-endian words from the blob base).
const HDR_MAGIC: usize = 0;
const HDR_OFF_DT_STRUCT: usize = 2;
const HDR_OFF_DT_STRINGS: usize = 3;

/// Magic value a live virtio-mmio device presents at register offset 0
/// (`"virt"` read as a little-endian word).
const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// A validated device-tree blob.
#[derive(Clone, Copy)]
pub struct DeviceTree {
    base: *const u8,
}

// SAFETY: the blob is immutable firmware-provided memory; shared access
// from any context is fine.
unsafe impl Send for DeviceTree {}
unsafe impl Sync for DeviceTree {}

impl DeviceTree {
    /// Wrap and validate a blob.
    ///
    /// # Safety
    ///
    /// `base` must point at a complete, well-formed DTB image that stays
    /// mapped and unmodified for the program's lifetime.
    pub unsafe fn new(base: *const u8) -> KernelResult<Self> {
        if base.is_null() {
            return Err(KernelError::InvalidDeviceTree);
        }
        let dt = Self { base };
        if dt.header_word(HDR_MAGIC) != FDT_MAGIC {
            return Err(KernelError::InvalidDeviceTree);
        }
        Ok(dt)
    }

    fn header_word(&self, index: usize) -> u32 {
        // SAFETY: the header is at least 10 words long in any valid blob
        // (constructor contract).
        u32::from_be(unsafe { ptr::read_unaligned(self.base.cast::<u32>().add(index)) })
    }

    /// Iterate over every property in the structure block.
    pub fn properties(&self) -> Properties<'_> {
        let struct_off = self.header_word(HDR_OFF_DT_STRUCT) as usize;
        let strings_off = self.header_word(HDR_OFF_DT_STRINGS) as usize;
        // SAFETY: offsets come from a validated header and stay within the
        // blob (constructor contract).
        unsafe {
            Properties {
                cursor: self.base.add(struct_off),
                strings: self.base.add(strings_off),
                node: "",
                done: false,
                _blob: PhantomData,
            }
        }
    }

    /// Locate the first RAM region.
    ///
    /// A node counts as memory once any of its properties says
    /// `device_type = "memory"`, or when the node name itself contains
    /// `"memory"`; the first such node's `reg` property (two
    /// address cells, two size cells) wins.
    pub fn memory_region(&self) -> Option<(u64, u64)> {
        let mut memory_seen = false;

        for prop in self.properties() {
            if prop.name == "device_type" && prop.data == b"memory\0" {
                memory_seen = true;
            }

            if (memory_seen || prop.node.contains("memory"))
                && prop.name == "reg"
                && prop.data.len() >= 16
            {
                let base = read_cell_pair(&prop.data[0..8]);
                let size = read_cell_pair(&prop.data[8..16]);
                return Some((base, size));
            }
        }

        None
    }

    /// Find a live virtio-mmio device with the given device id.
    ///
    /// Candidate nodes (name containing `"virtio"`, with a `reg` property)
    /// are probed in hardware: the MMIO magic and device-id registers must
    /// match. Returns the MMIO base of the first live match.
    pub fn find_virtio_device(&self, device_id: u32) -> Option<u64> {
        for prop in self.properties() {
            if prop.node.contains("virtio") && prop.name == "reg" && prop.data.len() >= 8 {
                let addr = read_cell_pair(&prop.data[0..8]);

                // Probe the hardware behind the advertised address.
                // SAFETY: the device tree maps this address to a virtio-mmio
                // register block; reading MAGIC and DEVICE_ID is side-effect
                // free.
                let (magic, id) = unsafe {
                    let mmio = addr as usize as *const u32;
                    (ptr::read_volatile(mmio), ptr::read_volatile(mmio.add(2)))
                };

                if magic == VIRTIO_MMIO_MAGIC && id == device_id {
                    return Some(addr);
                }
            }
        }

        None
    }
}

/// One property record from the structure block.
pub struct Property<'a> {
    /// Name of the node the property belongs to (empty for the root node).
    pub node: &'a str,
    /// Property name, resolved through the strings block.
    pub name: &'a str,
    /// Raw property data, big-endian as stored.
    pub data: &'a [u8],
}

/// Depth-agnostic walk over the structure block.
///
/// Only the innermost `BEGIN_NODE` name is tracked; `END_NODE` clears it.
/// That is all the two queries above need, and it keeps the walk a single
/// linear pass with no stack.
pub struct Properties<'a> {
    cursor: *const u8,
    strings: *const u8,
    node: &'a str,
    done: bool,
    _blob: PhantomData<&'a [u8]>,
}

impl<'a> Iterator for Properties<'a> {
    type Item = Property<'a>;

    fn next(&mut self) -> Option<Property<'a>> {
        if self.done {
            return None;
        }

        loop {
            // SAFETY: the cursor stays token-aligned inside the structure
            // block of a valid blob; the block is terminated by FDT_END.
            let token = u32::from_be(unsafe { ptr::read_unaligned(self.cursor.cast::<u32>()) });
            // SAFETY: see above; every token is at least one word.
            self.cursor = unsafe { self.cursor.add(4) };

            match token {
                FDT_BEGIN_NODE => {
                    // SAFETY: BEGIN_NODE is followed by a NUL-terminated
                    // name within the blob.
                    let name = unsafe { read_cstr(self.cursor) };
                    // SAFETY: name length + NUL, padded to 4 bytes, stays
                    // within the structure block.
                    self.cursor = unsafe { self.cursor.add((name.len() + 1 + 3) & !3) };
                    self.node = name;
                }
                FDT_END_NODE => {
                    self.node = "";
                }
                FDT_NOP => {}
                FDT_PROP => {
                    // SAFETY: PROP is followed by len and nameoff words,
                    // then len data bytes, all within the structure block.
                    let (len, nameoff) = unsafe {
                        let words = self.cursor.cast::<u32>();
                        (
                            u32::from_be(ptr::read_unaligned(words)) as usize,
                            u32::from_be(ptr::read_unaligned(words.add(1))) as usize,
                        )
                    };
                    // SAFETY: see above.
                    let data_ptr = unsafe { self.cursor.add(8) };
                    // SAFETY: data is len bytes, padded to a 4-byte
                    // boundary, all within the structure block.
                    self.cursor = unsafe { data_ptr.add((len + 3) & !3) };

                    // SAFETY: property data lives in the immutable blob;
                    // the name offset indexes the strings block.
                    let (name, data) = unsafe {
                        (
                            read_cstr(self.strings.add(nameoff)),
                            core::slice::from_raw_parts(data_ptr, len),
                        )
                    };

                    return Some(Property {
                        node: self.node,
                        name,
                        data,
                    });
                }
                FDT_END => {
                    self.done = true;
                    return None;
                }
                // Unknown token: skip it and keep scanning.
                _ => {}
            }
        }
    }
}

/// Read a big-endian `<hi lo>` cell pair as one 64-bit value.
fn read_cell_pair(data: &[u8]) -> u64 {
    let hi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let lo = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as u64;
    (hi << 32) | lo
}

/// Read a NUL-terminated string out of the blob.
///
/// # Safety
///
/// `ptr` must point at a NUL-terminated byte sequence that stays mapped.
unsafe fn read_cstr<'a>(ptr: *const u8) -> &'a str {
    let mut len = 0;
    // SAFETY: caller guarantees a terminating NUL before the mapping ends.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
    }
    // SAFETY: [ptr, ptr + len) was just scanned and contains no NUL; node
    // and property names in a DTB are 7-bit ASCII.
    unsafe { str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len)) }
}

// ---------------------------------------------------------------------------
// Global handle
// ---------------------------------------------------------------------------

static DEVICE_TREE: Once<DeviceTree> = Once::new();

/// Remember the blob handed over by the bootloader. An invalid blob is
/// silently ignored; the queries below then report nothing found.
///
/// # Safety
///
/// Same contract as [`DeviceTree::new`].
pub unsafe fn init(dtb: *const u8) {
    // SAFETY: forwarded contract.
    if let Ok(dt) = unsafe { DeviceTree::new(dtb) } {
        DEVICE_TREE.call_once(|| dt);
    }
}

/// First RAM region from the registered blob, if any.
pub fn memory_region() -> Option<(u64, u64)> {
    DEVICE_TREE.get().and_then(DeviceTree::memory_region)
}

/// MMIO base of a live virtio device with the given id, if any.
pub fn find_virtio_device(device_id: u32) -> Option<u64> {
    DEVICE_TREE
        .get()
        .and_then(|dt| dt.find_virtio_device(device_id))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::{vec, vec::Vec};

    use super::*;

    /// Builder for synthetic DTB images.
    struct BlobBuilder {
        structure: Vec<u8>,
        strings: Vec<u8>,
    }

    impl BlobBuilder {
        fn new() -> Self {
            Self {
                structure: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn token(&mut self, t: u32) -> &mut Self {
            self.structure.extend_from_slice(&t.to_be_bytes());
            self
        }

        fn begin_node(&mut self, name: &str) -> &mut Self {
            self.token(FDT_BEGIN_NODE);
            self.structure.extend_from_slice(name.as_bytes());
            self.structure.push(0);
            while self.structure.len() % 4 != 0 {
                self.structure.push(0);
            }
            self
        }

        fn end_node(&mut self) -> &mut Self {
            self.token(FDT_END_NODE)
        }

        fn prop(&mut self, name: &str, data: &[u8]) -> &mut Self {
            let nameoff = self.strings.len() as u32;
            self.strings.extend_from_slice(name.as_bytes());
            self.strings.push(0);

            self.token(FDT_PROP);
            self.structure
                .extend_from_slice(&(data.len() as u32).to_be_bytes());
            self.structure.extend_from_slice(&nameoff.to_be_bytes());
            self.structure.extend_from_slice(data);
            while self.structure.len() % 4 != 0 {
                self.structure.push(0);
            }
            self
        }

        fn finish(&mut self) -> Vec<u8> {
            self.token(FDT_END);

            const HEADER_LEN: usize = 40;
            let off_struct = HEADER_LEN;
            let off_strings = HEADER_LEN + self.structure.len();
            let total = off_strings + self.strings.len();

            let mut blob = Vec::with_capacity(total);
            let header: [u32; 10] = [
                FDT_MAGIC,
                total as u32,
                off_struct as u32,
                off_strings as u32,
                0, // off_mem_rsvmap
                17,
                16,
                0,
                self.strings.len() as u32,
                self.structure.len() as u32,
            ];
            for word in header {
                blob.extend_from_slice(&word.to_be_bytes());
            }
            blob.extend_from_slice(&self.structure);
            blob.extend_from_slice(&self.strings);
            blob
        }
    }

    fn reg_cells(pairs: &[(u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(a, b) in pairs {
            out.extend_from_slice(&((a >> 32) as u32).to_be_bytes());
            out.extend_from_slice(&(a as u32).to_be_bytes());
            out.extend_from_slice(&((b >> 32) as u32).to_be_bytes());
            out.extend_from_slice(&(b as u32).to_be_bytes());
        }
        out
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = BlobBuilder::new().finish();
        blob[0] = 0xff;
        assert!(unsafe { DeviceTree::new(blob.as_ptr()) }.is_err());
    }

    #[test]
    fn memory_by_device_type() {
        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("memory@40000000")
            .prop("device_type", b"memory\0")
            .prop("reg", &reg_cells(&[(0x4000_0000, 0x0800_0000)]))
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        assert_eq!(dt.memory_region(), Some((0x4000_0000, 0x0800_0000)));
    }

    #[test]
    fn memory_by_node_name() {
        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("memory@80000000")
            .prop("reg", &reg_cells(&[(0x8000_0000, 0x1000_0000)]))
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        assert_eq!(dt.memory_region(), Some((0x8000_0000, 0x1000_0000)));
    }

    #[test]
    fn no_memory_node() {
        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("chosen")
            .prop("bootargs", b"console=ttyAMA0\0")
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        assert_eq!(dt.memory_region(), None);
    }

    #[test]
    fn short_reg_is_ignored() {
        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("memory@0")
            .prop("reg", &[0u8; 8]) // one cell pair only
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        assert_eq!(dt.memory_region(), None);
    }

    #[test]
    fn properties_track_nodes() {
        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("uart@9000000")
            .prop("compatible", b"arm,pl011\0")
            .end_node()
            .begin_node("timer")
            .prop("interrupts", &[0, 0, 0, 1])
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        let props: Vec<_> = dt
            .properties()
            .map(|p| (p.node, p.name, p.data))
            .collect();

        assert_eq!(props.len(), 2);
        assert_eq!(props[0].0, "uart@9000000");
        assert_eq!(props[0].1, "compatible");
        assert_eq!(props[1].0, "timer");
        assert_eq!(props[1].2, &[0, 0, 0, 1]);
    }

    #[test]
    fn virtio_probe_skips_dead_devices() {
        // Fabricated register blocks: magic, version, device id, vendor.
        // The first has the right magic but the wrong device id; the
        // second is a live net device. Discovery must skip to the second.
        let dead: [u32; 4] = [0x7472_6976, 1, 2, 0x554d_4551];
        let live: [u32; 4] = [0x7472_6976, 1, 1, 0x554d_4551];

        let dead_addr = dead.as_ptr() as u64;
        let live_addr = live.as_ptr() as u64;

        let blob = BlobBuilder::new()
            .begin_node("")
            .begin_node("virtio_mmio@a000000")
            .prop("reg", &reg_cells(&[(dead_addr, 0x200)]))
            .end_node()
            .begin_node("virtio_mmio@a000200")
            .prop("reg", &reg_cells(&[(live_addr, 0x200)]))
            .end_node()
            .end_node()
            .finish();

        let dt = unsafe { DeviceTree::new(blob.as_ptr()) }.unwrap();
        assert_eq!(dt.find_virtio_device(1), Some(live_addr));
        assert_eq!(dt.find_virtio_device(9), None);
    }
}
