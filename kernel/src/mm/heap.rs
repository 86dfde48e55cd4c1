//! Kernel heap allocator.
//!
//! A bump allocator with a LIFO free list on top. The heap region is sized
//! at boot from the device tree (`[_heap_start, ram_base + ram_size)`);
//! until then the allocator is empty and any allocation panics.
//!
//! Every block is preceded by a 16-byte [`BlockHeader`] recording its total
//! (header + payload) size; while a block sits on the free list the header
//! additionally chains to the next free block. `allocate` first walks the
//! free list in insertion order, splitting oversized blocks, and only bumps
//! the cursor when nothing fits. Freed blocks are pushed onto the list head
//! and never coalesced -- fragmentation is the accepted cost, and
//! [`FreeListAllocator::deallocate`] is the hook where a coalescing pass
//! would go.
//!
//! Exhaustion is fatal: there is no swap path, so running off the end of the
//! region panics with `"Out of memory! System halted."`.

use core::{
    alloc::{GlobalAlloc, Layout},
    mem, ptr,
};

use spin::Mutex;

/// Allocation granularity and guaranteed payload alignment (AArch64 stack
/// and ABI alignment).
pub const ALLOC_ALIGN: usize = 16;

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Header preceding every heap block.
#[repr(C)]
struct BlockHeader {
    /// Total block size in bytes (header + payload), already aligned to
    /// [`ALLOC_ALIGN`].
    size: usize,
    /// Next free block; only meaningful while this block is on the free
    /// list.
    next: *mut BlockHeader,
}

/// Bump + free-list allocator over a single contiguous byte region.
///
/// The struct itself is pure bookkeeping over `[heap_start, heap_end)`;
/// nothing in it depends on where that region came from, which is what the
/// unit tests exploit by pointing it at a host-allocated arena.
pub struct FreeListAllocator {
    heap_start: usize,
    heap_end: usize,
    /// Bump cursor; always 16-byte aligned, never exceeds `heap_end`.
    heap_ptr: usize,
    free_list: *mut BlockHeader,
}

// SAFETY: the raw pointers refer into the heap region this allocator owns
// exclusively; access is serialized by the LockedHeap mutex.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    /// An allocator with no backing region; every allocation fails until
    /// [`init`](Self::init) is called.
    pub const fn empty() -> Self {
        Self {
            heap_start: 0,
            heap_end: 0,
            heap_ptr: 0,
            free_list: ptr::null_mut(),
        }
    }

    /// Install the heap region `[start, end)`.
    ///
    /// The bump cursor starts at `start` rounded up to the allocation
    /// granularity; an `end` below the cursor collapses the region to zero
    /// bytes rather than wrapping.
    ///
    /// # Safety
    ///
    /// `[start, end)` must be readable and writable for the lifetime of the
    /// allocator and referenced by nothing else.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        self.heap_start = start;
        self.heap_ptr = align_up(start, ALLOC_ALIGN);
        self.heap_end = if end < self.heap_ptr { self.heap_ptr } else { end };
        self.free_list = ptr::null_mut();
    }

    /// Bytes in the managed region.
    pub fn total(&self) -> usize {
        self.heap_end - self.heap_start
    }

    /// Bytes between the region start and the bump cursor. Blocks on the
    /// free list still count as used; only the bump cursor moves this.
    pub fn used(&self) -> usize {
        self.heap_ptr - self.heap_start
    }

    /// Bytes the bump cursor can still hand out.
    pub fn free(&self) -> usize {
        self.heap_end - self.heap_ptr
    }

    /// Number of blocks currently on the free list.
    pub fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut block = self.free_list;
        while !block.is_null() {
            len += 1;
            // SAFETY: every pointer on the free list was a valid block
            // header pushed by deallocate and is not aliased mutably.
            block = unsafe { (*block).next };
        }
        len
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// Returns null only on arithmetic overflow of the request; exhausting
    /// the region is a fatal panic.
    ///
    /// # Safety
    ///
    /// [`init`](Self::init) must have been called with a live region.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        let size = size.max(1);

        // Total required bytes (header + payload), aligned. Check for
        // overflow before rounding.
        let total = match HEADER_SIZE
            .checked_add(size)
            .and_then(|t| t.checked_add(ALLOC_ALIGN - 1))
        {
            Some(t) => t & !(ALLOC_ALIGN - 1),
            None => return ptr::null_mut(),
        };

        // First fit over the free list, in insertion order.
        let mut prev: *mut *mut BlockHeader = &mut self.free_list;
        // SAFETY: free-list pointers are valid block headers (deallocate
        // invariant); prev always points at the link we arrived through.
        unsafe {
            let mut block = self.free_list;
            while !block.is_null() {
                if (*block).size >= total {
                    let remain = (*block).size - total;

                    if remain >= HEADER_SIZE + ALLOC_ALIGN {
                        // Split: the tail keeps the leftover bytes and takes
                        // this block's place in the chain.
                        let tail = block.cast::<u8>().add(total).cast::<BlockHeader>();
                        (*tail).size = remain;
                        (*tail).next = (*block).next;
                        *prev = tail;
                        (*block).size = total;
                    } else {
                        // Too small to split; hand out the whole block.
                        *prev = (*block).next;
                    }

                    return block.cast::<u8>().add(HEADER_SIZE);
                }

                prev = &mut (*block).next;
                block = (*block).next;
            }
        }

        // Bump fallback.
        let aligned = align_up(self.heap_ptr, ALLOC_ALIGN);
        let end = aligned.checked_add(total);
        if end.is_none() || end.is_some_and(|e| e > self.heap_end) {
            panic!("Out of memory! System halted.");
        }

        let header = aligned as *mut BlockHeader;
        // SAFETY: [aligned, aligned + total) lies within the heap region
        // (checked above) and above the bump cursor, so nothing aliases it.
        unsafe {
            ptr::write(
                header,
                BlockHeader {
                    size: total,
                    next: ptr::null_mut(),
                },
            );
        }
        self.heap_ptr = aligned + total;

        // SAFETY: the payload starts HEADER_SIZE bytes into the block just
        // carved out above.
        unsafe { header.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Return `ptr`'s block to the free list (LIFO, no coalescing).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by
    /// [`allocate`](Self::allocate)/[`reallocate`](Self::reallocate) and not
    /// freed since.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // SAFETY: the block header sits immediately before the payload
        // (allocate invariant); caller guarantees ptr is a live allocation.
        unsafe {
            let block = ptr.sub(HEADER_SIZE).cast::<BlockHeader>();
            (*block).next = self.free_list;
            self.free_list = block;
        }
    }

    /// Resize an allocation.
    ///
    /// Returns `ptr` unchanged while the existing payload capacity covers
    /// `new_size`; otherwise moves the data into a fresh block and frees the
    /// old one. `reallocate(null, n)` allocates, `reallocate(p, 0)` frees
    /// and returns null.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate) for `ptr`.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            // SAFETY: allocate's contract is the caller's (init'd region).
            return unsafe { self.allocate(new_size) };
        }

        if new_size == 0 {
            // SAFETY: ptr is a live allocation per the caller contract.
            unsafe { self.deallocate(ptr) };
            return ptr::null_mut();
        }

        // SAFETY: the header precedes the payload; ptr is live.
        let old_payload = unsafe {
            let block = ptr.sub(HEADER_SIZE).cast::<BlockHeader>();
            (*block).size - HEADER_SIZE
        };

        if new_size <= old_payload {
            return ptr; // fits in place
        }

        // SAFETY: init'd region per caller contract.
        let new_ptr = unsafe { self.allocate(new_size) };
        if new_ptr.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: both blocks are live and at least old_payload bytes long
        // (the new one satisfies new_size > old_payload); they cannot
        // overlap because the old block has not been freed yet.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_payload);
            self.deallocate(ptr);
        }

        new_ptr
    }
}

/// The lock-wrapped allocator installed as `#[global_allocator]`.
pub struct LockedHeap {
    inner: Mutex<FreeListAllocator>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(FreeListAllocator::empty()),
        }
    }

    /// Install the heap region; see [`FreeListAllocator::init`].
    ///
    /// # Safety
    ///
    /// Same contract as [`FreeListAllocator::init`], and no allocation may
    /// be outstanding.
    pub unsafe fn init(&self, start: usize, end: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.lock().init(start, end) };
    }

    pub fn total(&self) -> usize {
        self.inner.lock().total()
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used()
    }

    pub fn free(&self) -> usize {
        self.inner.lock().free()
    }
}

// The free-list allocator guarantees 16-byte alignment. Larger alignments
// (the virtqueue's page-aligned ring memory) are served by over-allocating
// and stashing the true block pointer in the word below the returned
// address, where dealloc can find it again.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock();

        if layout.align() <= ALLOC_ALIGN {
            // SAFETY: region installed at boot (init contract).
            return unsafe { heap.allocate(layout.size()) };
        }

        let total = match layout.size().checked_add(layout.align()) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        // SAFETY: region installed at boot (init contract).
        let raw = unsafe { heap.allocate(total) };
        if raw.is_null() {
            return raw;
        }

        let aligned = align_up(raw as usize + 1, layout.align());
        // SAFETY: raw is 16-byte aligned and layout.align() is a larger
        // power of two, so aligned - raw >= 16: there is room for the stash
        // word below `aligned`, and aligned + size stays within the block.
        unsafe {
            *((aligned - mem::size_of::<usize>()) as *mut usize) = raw as usize;
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut heap = self.inner.lock();

        if layout.align() <= ALLOC_ALIGN {
            // SAFETY: ptr came from alloc with the same layout class.
            unsafe { heap.deallocate(ptr) };
        } else {
            // SAFETY: alloc stashed the true block pointer in the word
            // below the aligned address it returned.
            unsafe {
                let raw = *((ptr as usize - mem::size_of::<usize>()) as *const usize);
                heap.deallocate(raw as *mut u8);
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALLOC_ALIGN {
            // SAFETY: ptr is a live small-alignment allocation.
            return unsafe { self.inner.lock().reallocate(ptr, new_size) };
        }

        // Over-aligned blocks cannot grow in place; move them by hand.
        // SAFETY: new_size is non-zero per the GlobalAlloc contract and the
        // alignment is unchanged from a valid layout.
        let new_ptr = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
        if !new_ptr.is_null() {
            // SAFETY: both allocations are live and distinct; the copy
            // length is bounded by the smaller of the two.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}
