//! Offset-addressed primitives for shared memory control planes.
//!
//! This crate provides `no_std`-compatible building blocks for fixed-capacity
//! control structures living inside a memory-mapped region shared between
//! processes:
//!
//! - [`SlotRing`]: circular ring of fixed-size descriptor slots with
//!   peek-next/commit semantics
//! - [`FreeStack`]: LIFO pool of fixed-size buffer slots with O(1)
//!   acquire/release
//! - [`SpinLock`]: a `repr(C)` mutual-exclusion word embeddable in a shared
//!   header
//!
//! Rings and free stacks are *not* internally synchronized: callers serialize
//! access through the lock of the enclosing region. Nothing in this crate
//! stores a dereferenceable pointer inside shared memory; all cross-process
//! references are byte offsets from a [`Region`] base, resolved at the point
//! of use.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the spinlock and the
//! lock-protected structures across thread interleavings:
//!
//! ```text
//! cargo test -p skiff-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod freestack;
pub mod region;
pub mod ring;
pub mod spinlock;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use freestack::{FreeStack, FreeStackHeader};
pub use region::Region;
pub use ring::{SlotRing, SlotRingHeader};
pub use spinlock::{SpinLock, SpinLockGuard};
