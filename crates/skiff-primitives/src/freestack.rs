use core::mem::size_of;

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Free-stack header (64 bytes).
///
/// `top` is the number of free slots; the indices of those slots occupy
/// `entries[0..top]`. Atomics keep the header sound to map from several
/// processes, but every mutation must happen under the enclosing region's
/// lock; there is no internal synchronization.
#[repr(C, align(64))]
pub struct FreeStackHeader {
    /// Size of each buffer slot in bytes.
    pub slot_size: u32,
    /// Total number of slots.
    pub slot_count: u32,
    /// Number of slots currently free.
    pub top: AtomicU64,
    _pad: [u8; 48],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<FreeStackHeader>() == 64);

impl FreeStackHeader {
    pub fn init(&mut self, slot_size: u32, slot_count: u32) {
        self.slot_size = slot_size;
        self.slot_count = slot_count;
        self.top = AtomicU64::new(slot_count as u64);
        self._pad = [0; 48];
    }
}

/// A fixed-capacity LIFO pool of fixed-size buffer slots.
///
/// `acquire` fails fast when the pool is exhausted so the caller can abort
/// the whole operation and surface a retryable error; no partial state is
/// left behind. `release` is O(1). Double release of the same slot is a
/// caller error and is not detected.
///
/// Memory layout at `header_offset`:
///
/// ```text
/// [FreeStackHeader][u32 index; slot_count][slot data; slot_count * slot_size]
/// ```
pub struct FreeStack {
    region: Region,
    header_offset: usize,
    entries_offset: usize,
    data_offset: usize,
}

unsafe impl Send for FreeStack {}
unsafe impl Sync for FreeStack {}

impl FreeStack {
    /// Initialize a new free stack with all slots free.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        slot_count: u32,
        slot_size: u32,
    ) -> Self {
        assert!(slot_count > 0, "slot_count must be > 0");
        assert!(slot_size > 0, "slot_size must be > 0");
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );

        let entries_offset = header_offset + size_of::<FreeStackHeader>();
        let data_offset = align_up(
            entries_offset + slot_count as usize * size_of::<u32>(),
            64,
        );
        let required = data_offset + slot_count as usize * slot_size as usize;
        assert!(required <= region.len(), "region too small for free stack");

        let header = unsafe { region.get_mut::<FreeStackHeader>(header_offset) };
        header.init(slot_size, slot_count);

        let stack = Self {
            region,
            header_offset,
            entries_offset,
            data_offset,
        };

        for i in 0..slot_count {
            unsafe { stack.write_entry(i as usize, i) };
        }

        stack
    }

    /// Attach to an existing free stack.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized header at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );
        let header = unsafe { region.get::<FreeStackHeader>(header_offset) };
        assert!(header.slot_count > 0, "invalid slot_count");
        assert!(header.slot_size > 0, "invalid slot_size");

        let entries_offset = header_offset + size_of::<FreeStackHeader>();
        let data_offset = align_up(
            entries_offset + header.slot_count as usize * size_of::<u32>(),
            64,
        );
        let required = data_offset + header.slot_count as usize * header.slot_size as usize;
        assert!(required <= region.len(), "region too small for free stack");

        Self {
            region,
            header_offset,
            entries_offset,
            data_offset,
        }
    }

    #[inline]
    fn header(&self) -> &FreeStackHeader {
        unsafe { self.region.get::<FreeStackHeader>(self.header_offset) }
    }

    #[inline]
    unsafe fn write_entry(&self, pos: usize, index: u32) {
        let off = self.entries_offset + pos * size_of::<u32>();
        unsafe { *self.region.get_mut::<u32>(off) = index };
    }

    #[inline]
    unsafe fn read_entry(&self, pos: usize) -> u32 {
        let off = self.entries_offset + pos * size_of::<u32>();
        unsafe { *self.region.get::<u32>(off) }
    }

    /// Acquire a free slot, or `None` when the pool is exhausted.
    ///
    /// # Safety
    ///
    /// The caller must hold the enclosing region's lock.
    pub unsafe fn acquire(&self) -> Option<u32> {
        let header = self.header();
        let top = header.top.load(Ordering::Relaxed);
        if top == 0 {
            return None;
        }
        let index = unsafe { self.read_entry(top as usize - 1) };
        header.top.store(top - 1, Ordering::Release);
        Some(index)
    }

    /// Release a slot back to the pool.
    ///
    /// # Safety
    ///
    /// The caller must hold the enclosing region's lock and must own the
    /// slot; releasing the same slot twice corrupts the pool.
    pub unsafe fn release(&self, index: u32) {
        let header = self.header();
        debug_assert!(index < header.slot_count, "index out of pool");
        let top = header.top.load(Ordering::Relaxed);
        debug_assert!(top < header.slot_count as u64, "pool over-release");
        unsafe { self.write_entry(top as usize, index) };
        header.top.store(top + 1, Ordering::Release);
    }

    /// Number of free slots.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.header().top.load(Ordering::Relaxed) as u32
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.header().slot_size
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.header().slot_count
    }

    /// Raw pointer to a slot's buffer.
    ///
    /// # Safety
    ///
    /// `index` must be a slot acquired from this pool (or one whose offset
    /// was received over the command ring).
    #[inline]
    pub unsafe fn data_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.header().slot_count);
        let slot_size = self.header().slot_size as usize;
        self.region.offset(self.data_offset + index as usize * slot_size)
    }

    /// Byte offset of a slot's buffer within the backing region (the wire
    /// form carried inside command descriptors).
    #[inline]
    pub fn data_offset(&self, index: u32) -> usize {
        debug_assert!(index < self.header().slot_count);
        self.data_offset + index as usize * self.header().slot_size as usize
    }

    /// Inverse of [`FreeStack::data_offset`].
    #[inline]
    pub fn index_of_offset(&self, offset: usize) -> u32 {
        debug_assert!(offset >= self.data_offset);
        let rel = offset - self.data_offset;
        let slot_size = self.header().slot_size as usize;
        debug_assert!(rel % slot_size == 0);
        (rel / slot_size) as u32
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

/// Bytes required for a free stack of `slot_count` slots of `slot_size`.
pub fn freestack_size(slot_count: u32, slot_size: u32) -> usize {
    let entries = size_of::<FreeStackHeader>() + slot_count as usize * size_of::<u32>();
    align_up(entries, 64) + slot_count as usize * slot_size as usize
}
