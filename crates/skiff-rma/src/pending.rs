//! Local tracking of deferred operations.
//!
//! Each deferred operation holds one pending entry until the peer's response
//! retires it. The entry's index doubles as the `msg_id` carried in the
//! reserved response slot, so responses never carry process-local pointers.

use std::io;

use crate::cmd::{MemKind, OpFlags, RmaOp};
use crate::collab::Iov;
use crate::config::RMA_IOV_LIMIT;

/// Resource held by a deferred operation, returned to its pool when the
/// response retires the entry.
#[derive(Debug)]
pub enum StagedResource {
    None,
    /// Buffer index in the *peer's* inject pool (deferred reads).
    Inject { index: u32 },
    /// Chunk indices in our own staging pool, plus the gate that keeps the
    /// peer pair to one transfer at a time.
    Sar {
        chunks: [u32; RMA_IOV_LIMIT],
        chunk_count: usize,
    },
    /// Owned shared file mapping; unmapped and unlinked on drop.
    Mmap(MmapStage),
}

/// One in-flight deferred operation.
#[derive(Debug)]
pub struct PendingEntry {
    pub context: usize,
    pub op: RmaOp,
    pub flags: OpFlags,
    pub mem_kind: MemKind,
    pub device: u64,
    pub peer_id: i32,
    pub iov: [Iov; RMA_IOV_LIMIT],
    pub iov_count: usize,
    pub total: usize,
    /// Bytes already staged or delivered; progress continues from here.
    pub bytes_done: usize,
    pub resource: StagedResource,
}

// Entries reference caller buffers that stay pinned until completion; the
// pool itself is only touched under the endpoint's tx lock.
unsafe impl Send for PendingEntry {}

/// Fixed-capacity pool of pending entries, indexed by `msg_id`.
///
/// `acquire` fails fast on exhaustion so the caller can unwind the whole
/// operation and report retryable busy.
pub struct PendingPool {
    slots: Vec<Option<PendingEntry>>,
    free: Vec<u32>,
}

impl PendingPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    /// Track a new entry. On exhaustion the entry is handed back so the
    /// caller can unwind its staged resource.
    pub fn acquire(&mut self, entry: PendingEntry) -> Result<u32, PendingEntry> {
        let Some(index) = self.free.pop() else {
            return Err(entry);
        };
        self.slots[index as usize] = Some(entry);
        Ok(index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut PendingEntry> {
        self.slots.get_mut(index as usize).and_then(Option::as_mut)
    }

    /// Retire an entry, handing its staged resource back to the caller.
    pub fn complete(&mut self, index: u32) -> Option<PendingEntry> {
        let entry = self.slots.get_mut(index as usize).and_then(Option::take)?;
        self.free.push(index);
        Some(entry)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ============================================================================
// Mmap staging
// ============================================================================

/// A named shared-memory object staging one oversized transfer.
///
/// The name travels in the command; the peer opens and maps the same object.
/// Dropping the stage unmaps and unlinks it.
#[derive(Debug)]
pub struct MmapStage {
    name: [u8; 64],
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MmapStage {}

impl MmapStage {
    pub fn create(tag: u64, len: usize) -> io::Result<Self> {
        let mut name = [0u8; 64];
        let text = format!("/skiff-rma-{}-{}", std::process::id(), tag);
        name[..text.len()].copy_from_slice(text.as_bytes());

        let cname = std::ffi::CStr::from_bytes_with_nul(&name[..text.len() + 1])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad shm name"))?;

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(err);
        }

        Ok(Self {
            name,
            ptr: ptr.cast(),
            len,
        })
    }

    /// NUL-padded object name in wire form.
    pub fn name(&self) -> [u8; 64] {
        self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is private to this process until the command
        // naming it is committed.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MmapStage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
            let end = self
                .name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(self.name.len() - 1);
            let mut cname = [0i8; 65];
            for (dst, src) in cname.iter_mut().zip(&self.name[..=end]) {
                *dst = *src as i8;
            }
            libc::shm_unlink(cname.as_ptr().cast());
        }
    }
}
