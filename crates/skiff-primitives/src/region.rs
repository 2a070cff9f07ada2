use core::mem::{align_of, size_of};

/// A borrowed view of a contiguous memory region.
///
/// A `Region` is a base pointer plus a length. It does not own the memory;
/// the creator (an mmap wrapper, a [`HeapRegion`], ...) is responsible for
/// keeping it alive and mapped for as long as any `Region` copy is in use.
///
/// All typed accessors take byte offsets from the base. Structures stored in
/// shared memory reference each other by such offsets, never by raw
/// addresses, so the same bytes are meaningful in every process that maps
/// them.
#[derive(Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region view over raw memory.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes and remain so
    /// for the lifetime of every copy of this view.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the byte at `offset`.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len, "offset out of region");
        // Wrapping add keeps this a plain address computation; callers only
        // dereference after their own bounds checks.
        self.base.wrapping_add(offset)
    }

    /// Byte offset of a pointer that lies inside this region.
    ///
    /// This is the wire form of a reference: the offset is what gets stored
    /// in a shared structure, and the peer resolves it against its own
    /// mapping of the same region.
    #[inline]
    pub fn offset_of<T>(&self, ptr: *const T) -> usize {
        let addr = ptr as usize;
        let base = self.base as usize;
        debug_assert!(addr >= base && addr <= base + self.len, "pointer outside region");
        addr - base
    }

    /// Typed shared reference at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be in bounds for a `T`, properly aligned, and the bytes
    /// must be a valid `T`. Callers must uphold aliasing: concurrent writers
    /// must be excluded or the `T` must be built from atomics.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + size_of::<T>() <= self.len, "T out of region");
        debug_assert!(offset % align_of::<T>() == 0, "T misaligned");
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Typed exclusive reference at `offset`.
    ///
    /// # Safety
    ///
    /// As [`Region::get`], plus the caller must guarantee exclusive access
    /// for the lifetime of the returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        debug_assert!(offset + size_of::<T>() <= self.len, "T out of region");
        debug_assert!(offset % align_of::<T>() == 0, "T misaligned");
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }
}

/// An owned, zero-initialized, 64-byte-aligned region on the heap.
///
/// Used for process-local pools and for tests that exercise shared-region
/// code paths without an actual mapping.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    base: *mut u8,
    len: usize,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate a zeroed region of `len` bytes, aligned to a cache line.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region must be non-empty");
        let layout = alloc::alloc::Layout::from_size_align(len, 64).expect("bad region layout");
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { base, len }
    }

    /// Borrow a [`Region`] view. The view must not outlive `self`.
    pub fn region(&self) -> Region {
        // SAFETY: base is valid for len bytes while self is alive.
        unsafe { Region::from_raw(self.base, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        let layout =
            alloc::alloc::Layout::from_size_align(self.len, 64).expect("bad region layout");
        // SAFETY: allocated in new_zeroed with the same layout.
        unsafe { alloc::alloc::dealloc(self.base, layout) };
    }
}
