use crate::sync::{spin_loop, AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual-exclusion word embeddable in a shared-memory header.
///
/// Hold times are expected to be short (a handful of ring/pool writes), so a
/// spin is preferred over a kernel-mediated lock. The word is a single
/// `AtomicU32` so it has a `repr(C)`-stable layout inside a shared header and
/// is meaningful in every process that maps the region.
#[repr(C)]
pub struct SpinLock {
    state: AtomicU32,
}

// 4 bytes; headers embedding this are responsible for their own padding.
#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SpinLock>() == 4);

impl SpinLock {
    /// A fresh, unlocked lock (for process-local embedding; shared headers
    /// are zero-initialized and then [`SpinLock::init`]-ed instead).
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset the lock to its unlocked state.
    ///
    /// Called once during region initialization, before any concurrent
    /// access.
    pub fn init(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.state.load(Ordering::Relaxed) == LOCKED {
                spin_loop();
            }
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        match self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(SpinLockGuard { lock: self }),
            Err(_) => None,
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; releasing the guard releases the lock.
///
/// Guards make it impossible to return out of a check/write/commit sequence
/// without releasing the region lock on that path.
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
