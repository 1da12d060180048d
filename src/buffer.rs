//! Endpoint buffer allocation.
//!
//! There are two budgets, depending on the endpoint-management strategy:
//!
//! - Direct-copy and triggered-DMA endpoints partition the controller's
//!   shared hardware buffer statically. [`HardwareAllocator`] hands out
//!   non-overlapping offset regions into that memory.
//! - Autonomous-DMA endpoints additionally shadow their data in ordinary RAM
//!   supplied by the caller. [`EndpointMemory`] owns that static allocation
//!   and [`Allocator`] carves [`Buffer`]s out of it.
//!
//! Under 16-bit data-register access, every region is rounded up to an even
//! physical length; the logical length is what the caller declared.

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// Round `len` up to the next even value when `word_access` is set.
fn pad(len: u16, word_access: bool) -> u16 {
    if word_access {
        (len + 1) & !1
    } else {
        len
    }
}

/// A reserved, non-overlapping slice of the shared hardware buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    start: u16,
    len: u16,
    padded: u16,
}

impl Region {
    pub fn start(&self) -> usize {
        usize::from(self.start)
    }
    /// The logical length, as declared at allocation.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }
    /// The physical length, including any access-width padding.
    pub fn padded_len(&self) -> usize {
        usize::from(self.padded)
    }
    pub fn end(&self) -> usize {
        self.start() + self.padded_len()
    }
}

/// Bump allocator over the shared hardware endpoint buffer.
pub struct HardwareAllocator {
    next: u16,
    capacity: u16,
    word_access: bool,
}

impl HardwareAllocator {
    pub fn new(capacity: u16, word_access: bool) -> Self {
        HardwareAllocator {
            next: 0,
            capacity,
            word_access,
        }
    }

    /// Reserve `len` bytes. Fails without side effects when the remaining
    /// budget is too small.
    pub fn allocate(&mut self, len: u16) -> Option<Region> {
        let padded = pad(len, self.word_access);
        let end = self.next.checked_add(padded)?;
        if end > self.capacity {
            return None;
        }
        let region = Region {
            start: self.next,
            len,
            padded,
        };
        self.next = end;
        Some(region)
    }

    /// Give back everything above `high_water`, the largest end offset still
    /// reserved by a live endpoint.
    pub fn rewind(&mut self, high_water: u16) {
        debug_assert!(high_water <= self.next);
        self.next = high_water;
    }
}

/// RAM shadow memory for autonomous-DMA endpoints.
///
/// Allocate a `static` object sized to the sum of your endpoint buffer sizes
/// (each padded to an even length under 16-bit access), and pass its
/// allocator in the driver configuration:
///
/// ```
/// use usbfs_device::EndpointMemory;
///
/// static EP_MEMORY: EndpointMemory<512> = EndpointMemory::new();
/// let alloc = EP_MEMORY.allocator().unwrap();
/// ```
pub struct EndpointMemory<const SIZE: usize> {
    memory: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

// Safety: the taken flag ensures a single allocator, and the allocator is the
// only access path to the memory.
unsafe impl<const SIZE: usize> Sync for EndpointMemory<SIZE> {}

impl<const SIZE: usize> EndpointMemory<SIZE> {
    pub const fn new() -> Self {
        EndpointMemory {
            memory: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the allocator.
    ///
    /// Returns `None` if the allocator was already taken.
    pub fn allocator(&self) -> Option<Allocator> {
        if self.taken.swap(true, Ordering::SeqCst) {
            None
        } else {
            // Safety: the swap above makes this the only reference to the
            // memory; Allocator assumes ownership.
            Some(unsafe { Allocator::new(NonNull::new_unchecked(self.memory.get().cast()), SIZE) })
        }
    }
}

/// Bump allocator over a RAM shadow buffer.
pub struct Allocator {
    start: *mut u8,
    next: usize,
    size: usize,
}

impl Allocator {
    /// # Safety
    ///
    /// Caller must ensure `start` points to an allocation of `size` bytes,
    /// and that no one else is using this memory for anything else.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        Allocator {
            start: start.as_ptr(),
            next: 0,
            size,
        }
    }

    /// Allocates a buffer of `size` bytes, padded to an even length when
    /// `word_access` is set.
    pub fn allocate(&mut self, size: usize, word_access: bool) -> Option<Buffer> {
        let padded = usize::from(pad(size as u16, word_access));
        let end = self.next.checked_add(padded)?;
        if end > self.size {
            return None;
        }
        // Safety: offset stays inside the allocation checked above.
        let ptr = unsafe { NonNull::new_unchecked(self.start.add(self.next)) };
        self.next = end;
        Some(Buffer { ptr, len: size })
    }

    /// Give back everything allocated after the first `offset` bytes.
    pub fn rewind(&mut self, offset: usize) {
        debug_assert!(offset <= self.next);
        self.next = offset;
    }

    /// The offset that the next allocation would start at.
    pub fn mark(&self) -> usize {
        self.next
    }
}

// Safety: the allocator owns its memory per the construction contract.
unsafe impl Send for Allocator {}

/// A slice of the RAM shadow buffer, owned by one endpoint.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy into the buffer with the supplied memcpy primitive. Returns the
    /// number of bytes written, bounded by the buffer capacity.
    pub fn fill(&mut self, src: &[u8], copy: fn(&mut [u8], &[u8])) -> usize {
        let size = self.len.min(src.len());
        // Safety: the buffer owns len bytes starting at ptr.
        let dst = unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), size) };
        copy(dst, &src[..size]);
        size
    }

    /// Copy out of the buffer with the supplied memcpy primitive. Returns the
    /// number of bytes read.
    pub fn drain(&self, dst: &mut [u8], size: usize, copy: fn(&mut [u8], &[u8])) -> usize {
        let size = size.min(self.len).min(dst.len());
        // Safety: the buffer owns len bytes starting at ptr.
        let src = unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), size) };
        copy(&mut dst[..size], src);
        size
    }
}

// Safety: the buffer exclusively owns its slice of the shadow memory.
unsafe impl Send for Buffer {}
