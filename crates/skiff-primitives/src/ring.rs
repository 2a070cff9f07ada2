use core::mem::{align_of, size_of};

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Slot ring header (192 bytes, cache-line separated counters).
///
/// `write_cnt` and `read_cnt` are monotonically increasing; the slot for a
/// count is `count & (capacity - 1)`. The counters are atomics only so the
/// header is sound to share between processes; the ring is *not* internally
/// synchronized, and every mutation must happen under the enclosing region's
/// lock.
#[repr(C)]
pub struct SlotRingHeader {
    /// Count of slots ever committed by the producer.
    pub write_cnt: AtomicU64,
    _pad1: [u8; 56],

    /// Count of slots ever consumed.
    pub read_cnt: AtomicU64,
    _pad2: [u8; 56],

    /// Ring capacity (power of 2, immutable after init).
    pub capacity: u32,
    _pad3: [u8; 60],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SlotRingHeader>() == 192);

impl SlotRingHeader {
    /// Initialize a new ring header.
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.write_cnt = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.read_cnt = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self._pad3 = [0; 60];
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }
}

/// A circular ring of fixed-size descriptor slots in a shared region.
///
/// Producer protocol: [`SlotRing::next_tx`] peeks the next writable slot
/// without advancing; the producer fully populates it and then calls
/// [`SlotRing::commit_tx`]. A consumer never observes a partially written
/// slot because the commit (and the peek on the consumer side) happen under
/// the same external lock.
pub struct SlotRing<T> {
    region: Region,
    header_offset: usize,
    slots_offset: usize,
    _marker: core::marker::PhantomData<T>,
}

unsafe impl<T: Send> Send for SlotRing<T> {}
unsafe impl<T: Send> Sync for SlotRing<T> {}

impl<T> SlotRing<T> {
    /// Initialize a new ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "capacity must be power of 2"
        );
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "slot alignment must be <= 64");

        let slots_offset = header_offset + size_of::<SlotRingHeader>();
        let required = slots_offset + (capacity as usize * size_of::<T>());
        assert!(required <= region.len(), "region too small for ring");
        assert!(slots_offset % align_of::<T>() == 0, "slots misaligned");

        let header = unsafe { region.get_mut::<SlotRingHeader>(header_offset) };
        header.init(capacity);

        Self {
            region,
            header_offset,
            slots_offset,
            _marker: core::marker::PhantomData,
        }
    }

    /// Attach to an existing ring in the region.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );
        let slots_offset = header_offset + size_of::<SlotRingHeader>();
        let header = unsafe { region.get::<SlotRingHeader>(header_offset) };
        let capacity = header.capacity;

        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "invalid ring capacity"
        );
        let required = slots_offset + (capacity as usize * size_of::<T>());
        assert!(required <= region.len(), "region too small for ring");

        Self {
            region,
            header_offset,
            slots_offset,
            _marker: core::marker::PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &SlotRingHeader {
        unsafe { self.region.get::<SlotRingHeader>(self.header_offset) }
    }

    #[inline]
    fn slot_ptr(&self, count: u64) -> *mut T {
        let slot = (count & self.header().mask()) as usize;
        let base = self.region.offset(self.slots_offset);
        // SAFETY of the arithmetic: slot < capacity, checked at init/attach.
        unsafe { (base as *mut T).add(slot) }
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let header = self.header();
        header.read_cnt.load(Ordering::Relaxed) == header.write_cnt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let header = self.header();
        let write = header.write_cnt.load(Ordering::Relaxed);
        let read = header.read_cnt.load(Ordering::Relaxed);
        write.wrapping_sub(read) >= header.capacity as u64
    }

    /// Number of committed, unconsumed slots.
    #[inline]
    pub fn len(&self) -> u64 {
        let header = self.header();
        header
            .write_cnt
            .load(Ordering::Relaxed)
            .wrapping_sub(header.read_cnt.load(Ordering::Relaxed))
    }

    /// Peek the next writable slot without advancing.
    ///
    /// Returns `None` when the ring is full. The caller must fully populate
    /// the slot before calling [`SlotRing::commit_tx`].
    ///
    /// # Safety
    ///
    /// The caller must hold the enclosing region's lock and must not keep the
    /// returned reference across `commit_tx`/lock release.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn next_tx(&self) -> Option<&mut T> {
        if self.is_full() {
            return None;
        }
        let write = self.header().write_cnt.load(Ordering::Relaxed);
        Some(unsafe { &mut *self.slot_ptr(write) })
    }

    /// Advance the write cursor, publishing the slot returned by the last
    /// [`SlotRing::next_tx`].
    ///
    /// # Safety
    ///
    /// Same locking requirement as `next_tx`, and the peeked slot must be
    /// fully populated.
    #[inline]
    pub unsafe fn commit_tx(&self) {
        let header = self.header();
        let write = header.write_cnt.load(Ordering::Relaxed);
        header.write_cnt.store(write.wrapping_add(1), Ordering::Release);
    }

    /// Peek the next committed slot without consuming it.
    ///
    /// # Safety
    ///
    /// The caller must hold the enclosing region's lock.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn next_rx(&self) -> Option<&mut T> {
        if self.is_empty() {
            return None;
        }
        let read = self.header().read_cnt.load(Ordering::Acquire);
        Some(unsafe { &mut *self.slot_ptr(read) })
    }

    /// Consume the slot returned by the last [`SlotRing::next_rx`].
    ///
    /// # Safety
    ///
    /// Same locking requirement as `next_rx`.
    #[inline]
    pub unsafe fn discard_rx(&self) {
        let header = self.header();
        let read = header.read_cnt.load(Ordering::Relaxed);
        header.read_cnt.store(read.wrapping_add(1), Ordering::Release);
    }

    /// Byte offset of the slot behind `ptr` within the backing region.
    ///
    /// This is the wire form of a slot reference: commands carry this offset
    /// so the peer can locate the slot in its own mapping.
    #[inline]
    pub fn slot_offset(&self, ptr: *const T) -> usize {
        self.region.offset_of(ptr)
    }

    /// Resolve a slot offset (from [`SlotRing::slot_offset`]) back to a
    /// reference.
    ///
    /// # Safety
    ///
    /// `offset` must have been produced by `slot_offset` on this ring and
    /// the caller must hold the access rights for the slot.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_at(&self, offset: usize) -> &mut T {
        debug_assert!(offset >= self.slots_offset);
        debug_assert!(
            offset + size_of::<T>()
                <= self.slots_offset + self.capacity() as usize * size_of::<T>()
        );
        unsafe { self.region.get_mut::<T>(offset) }
    }
}
