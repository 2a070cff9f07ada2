//! Shared region layout.
//!
//! Every endpoint owns one region. Traffic *to* an endpoint lands in that
//! endpoint's own region: its command ring, its inject pool, and the credit
//! counter gating them all live there, guarded by the region spinlock.
//! Traffic *about* an endpoint's own requests (deferred-read responses, SAR
//! staging) lives in the requester's region.
//!
//! ```text
//! [RegionHeader][cmd ring][resp ring][inject pool][sar pool][peer data]
//! ```
//!
//! All cross-references inside the region are byte offsets from its base.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use skiff_primitives::{
    freestack::freestack_size, FreeStack, HeapRegion, Region, SlotRing, SlotRingHeader, SpinLock,
    SpinLockGuard,
};

use crate::cmd::{Cmd, Resp};
use crate::config::{ConfigError, RmaConfig};

pub const REGION_MAGIC: u64 = 0x534b_4946_465f_524d; // "SKIFF_RM"
pub const REGION_VERSION: u32 = 2;

// ============================================================================
// Header
// ============================================================================

/// Fixed 128-byte header at region offset 0.
///
/// The layout fields echo the creator's configuration; an attaching process
/// validates them against its own and refuses a mismatch rather than
/// reading slots at the wrong stride.
#[repr(C, align(64))]
pub struct RegionHeader {
    pub magic: u64,
    pub version: u32,
    /// Creator's pid, the target of cross-process copies into this region's
    /// owner.
    pub owner_pid: u32,
    pub ring_capacity: u32,
    pub inline_size: u32,
    pub inject_size: u32,
    pub inject_count: u32,
    pub sar_chunk_size: u32,
    pub sar_count: u32,
    pub max_peers: u32,
    _pad0: u32,
    pub total_len: u64,
    pub cmd_ring_offset: u64,
    pub resp_ring_offset: u64,
    pub inject_pool_offset: u64,
    pub sar_pool_offset: u64,
    pub peer_data_offset: u64,
    /// Guards the command ring, both pools, the credit counter and the peer
    /// data array.
    pub lock: SpinLock,
    _pad1: [u8; 4],
    /// Command slots the owner has not yet consumed and acknowledged.
    /// Decremented in lock-step with each committed slot, replenished by the
    /// owner's progress side.
    pub cmd_credit: AtomicU64,
    _pad2: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == 128);

/// One per-peer entry in the region owner's peer array.
#[repr(C)]
pub struct PeerData {
    /// The owner's id in that peer's table, -1 until the peers have
    /// exchanged ids.
    pub remote_id: i64,
    /// Nonzero while a segment-and-reassemble transfer to this peer is in
    /// flight. At most one per peer pair.
    sar_status: AtomicU32,
    _pad: [u8; 20],
}

const _: () = assert!(core::mem::size_of::<PeerData>() == 32);

impl PeerData {
    /// Whether a SAR transfer to this peer is already in flight. Caller
    /// holds the region lock.
    pub fn sar_active(&self) -> bool {
        self.sar_status.load(Ordering::Relaxed) != 0
    }

    /// Mark a SAR transfer in flight. Caller holds the region lock and has
    /// checked [`PeerData::sar_active`].
    pub fn set_sar_active(&self) {
        debug_assert!(!self.sar_active());
        self.sar_status.store(1, Ordering::Release);
    }

    /// Called by the progress side once the transfer's last chunk is acked.
    pub fn clear_sar(&self) {
        self.sar_status.store(0, Ordering::Release);
    }
}

// ============================================================================
// Offsets
// ============================================================================

/// Byte offsets of every section, derived from a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOffsets {
    pub cmd_ring: usize,
    pub resp_ring: usize,
    pub inject_pool: usize,
    pub sar_pool: usize,
    pub peer_data: usize,
    pub total: usize,
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

fn ring_size<T>(capacity: u32) -> Option<usize> {
    (capacity as usize)
        .checked_mul(core::mem::size_of::<T>())?
        .checked_add(core::mem::size_of::<SlotRingHeader>())
}

impl RegionOffsets {
    pub fn calculate(config: &RmaConfig) -> Result<Self, RegionError> {
        config.validate()?;

        let overflow = || RegionError::Layout("section size overflow");

        let cmd_ring = core::mem::size_of::<RegionHeader>();
        let resp_ring = align_up(
            cmd_ring
                .checked_add(ring_size::<Cmd>(config.ring_capacity).ok_or_else(overflow)?)
                .ok_or_else(overflow)?,
            64,
        );
        let inject_pool = align_up(
            resp_ring
                .checked_add(ring_size::<Resp>(config.ring_capacity).ok_or_else(overflow)?)
                .ok_or_else(overflow)?,
            64,
        );
        let sar_pool = align_up(
            inject_pool
                .checked_add(freestack_size(config.inject_count, config.inject_size))
                .ok_or_else(overflow)?,
            64,
        );
        let peer_data = align_up(
            sar_pool
                .checked_add(freestack_size(config.sar_count, config.sar_chunk_size))
                .ok_or_else(overflow)?,
            64,
        );
        let total = align_up(
            peer_data
                .checked_add(config.max_peers as usize * core::mem::size_of::<PeerData>())
                .ok_or_else(overflow)?,
            4096,
        );

        Ok(Self {
            cmd_ring,
            resp_ring,
            inject_pool,
            sar_pool,
            peer_data,
            total,
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum RegionError {
    Config(ConfigError),
    Layout(&'static str),
    Incompatible(&'static str),
    Io(io::Error),
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Layout(msg) => write!(f, "region layout: {msg}"),
            Self::Incompatible(msg) => write!(f, "incompatible region: {msg}"),
            Self::Io(e) => write!(f, "region io: {e}"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for RegionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<io::Error> for RegionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================================
// Backing memory
// ============================================================================

enum Backing {
    Heap(HeapRegion),
    Mmap(MmapBacking),
}

struct MmapBacking {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MmapBacking {}
unsafe impl Sync for MmapBacking {}

impl MmapBacking {
    fn map_file(path: &std::path::Path, create_len: Option<usize>) -> Result<Self, RegionError> {
        use std::os::unix::ffi::OsStrExt;

        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| RegionError::Layout("path contains NUL"))?;

        let flags = if create_len.is_some() {
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::open(cpath.as_ptr(), flags | libc::O_CLOEXEC, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let len = match create_len {
            Some(len) => {
                if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err.into());
                }
                len
            }
            None => {
                let mut st: libc::stat = unsafe { core::mem::zeroed() };
                if unsafe { libc::fstat(fd, &mut st) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err.into());
                }
                st.st_size as usize
            }
        };

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
        // The mapping keeps the file alive; the descriptor is no longer
        // needed either way.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }
}

impl Drop for MmapBacking {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

impl Backing {
    fn region(&self) -> Region {
        match self {
            Self::Heap(heap) => heap.region(),
            // SAFETY: the mapping lives as long as self.
            Self::Mmap(map) => unsafe { Region::from_raw(map.ptr, map.len) },
        }
    }
}

// ============================================================================
// Region
// ============================================================================

/// One endpoint's shared region, attached and structured.
pub struct RmaRegion {
    backing: Backing,
    offsets: RegionOffsets,
    cmd_ring: SlotRing<Cmd>,
    resp_ring: SlotRing<Resp>,
    inject_pool: FreeStack,
    sar_pool: FreeStack,
}

impl RmaRegion {
    /// Create an anonymous in-process region. Used by tests and single
    /// process deployments.
    pub fn create_anon(config: &RmaConfig) -> Result<Self, RegionError> {
        let offsets = RegionOffsets::calculate(config)?;
        let backing = Backing::Heap(HeapRegion::new_zeroed(offsets.total));
        // SAFETY: freshly allocated, exclusively owned.
        unsafe { Self::init_in(backing, offsets, config) }
    }

    /// Create and initialize a file-backed region at `path`. Fails if the
    /// file already exists.
    pub fn create_file(path: &std::path::Path, config: &RmaConfig) -> Result<Self, RegionError> {
        let offsets = RegionOffsets::calculate(config)?;
        let backing = Backing::Mmap(MmapBacking::map_file(path, Some(offsets.total))?);
        // SAFETY: freshly created file, ftruncate zero-fills it.
        unsafe { Self::init_in(backing, offsets, config) }
    }

    /// Attach to a region created by another process.
    pub fn open_file(path: &std::path::Path) -> Result<Self, RegionError> {
        let backing = Backing::Mmap(MmapBacking::map_file(path, None)?);
        let region = backing.region();
        if region.len() < core::mem::size_of::<RegionHeader>() {
            return Err(RegionError::Incompatible("shorter than a header"));
        }
        // SAFETY: header bounds just checked; the creator initialized it.
        let header = unsafe { region.get::<RegionHeader>(0) };
        if header.magic != REGION_MAGIC {
            return Err(RegionError::Incompatible("bad magic"));
        }
        if header.version != REGION_VERSION {
            return Err(RegionError::Incompatible("version mismatch"));
        }
        if header.total_len as usize > region.len() {
            return Err(RegionError::Incompatible("truncated mapping"));
        }

        let offsets = RegionOffsets {
            cmd_ring: header.cmd_ring_offset as usize,
            resp_ring: header.resp_ring_offset as usize,
            inject_pool: header.inject_pool_offset as usize,
            sar_pool: header.sar_pool_offset as usize,
            peer_data: header.peer_data_offset as usize,
            total: header.total_len as usize,
        };
        let expected = RegionOffsets::calculate(&Self::config_from_header(header))?;
        if expected != offsets {
            return Err(RegionError::Incompatible("section offsets disagree"));
        }

        // SAFETY: offsets validated against the echoed config.
        let cmd_ring = unsafe { SlotRing::attach(region, offsets.cmd_ring) };
        let resp_ring = unsafe { SlotRing::attach(region, offsets.resp_ring) };
        let inject_pool = unsafe { FreeStack::attach(region, offsets.inject_pool) };
        let sar_pool = unsafe { FreeStack::attach(region, offsets.sar_pool) };

        Ok(Self {
            backing,
            offsets,
            cmd_ring,
            resp_ring,
            inject_pool,
            sar_pool,
        })
    }

    fn config_from_header(header: &RegionHeader) -> RmaConfig {
        RmaConfig {
            ring_capacity: header.ring_capacity,
            inline_size: header.inline_size,
            inject_size: header.inject_size,
            inject_count: header.inject_count,
            sar_chunk_size: header.sar_chunk_size,
            sar_count: header.sar_count,
            max_peers: header.max_peers,
            ..RmaConfig::default()
        }
    }

    /// # Safety
    ///
    /// `backing` must be zeroed, at least `offsets.total` long, and not yet
    /// shared with any other process.
    unsafe fn init_in(
        backing: Backing,
        offsets: RegionOffsets,
        config: &RmaConfig,
    ) -> Result<Self, RegionError> {
        let region = backing.region();
        if region.len() < offsets.total {
            return Err(RegionError::Layout("backing shorter than layout"));
        }

        let cmd_ring = unsafe { SlotRing::init(region, offsets.cmd_ring, config.ring_capacity) };
        let resp_ring = unsafe { SlotRing::init(region, offsets.resp_ring, config.ring_capacity) };
        let inject_pool = unsafe {
            FreeStack::init(
                region,
                offsets.inject_pool,
                config.inject_count,
                config.inject_size,
            )
        };
        let sar_pool = unsafe {
            FreeStack::init(
                region,
                offsets.sar_pool,
                config.sar_count,
                config.sar_chunk_size,
            )
        };

        for id in 0..config.max_peers {
            let off = offsets.peer_data + id as usize * core::mem::size_of::<PeerData>();
            unsafe { region.get_mut::<PeerData>(off) }.remote_id = -1;
        }

        let header = unsafe { region.get_mut::<RegionHeader>(0) };
        *header = RegionHeader {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            owner_pid: std::process::id(),
            ring_capacity: config.ring_capacity,
            inline_size: config.inline_size,
            inject_size: config.inject_size,
            inject_count: config.inject_count,
            sar_chunk_size: config.sar_chunk_size,
            sar_count: config.sar_count,
            max_peers: config.max_peers,
            _pad0: 0,
            total_len: offsets.total as u64,
            cmd_ring_offset: offsets.cmd_ring as u64,
            resp_ring_offset: offsets.resp_ring as u64,
            inject_pool_offset: offsets.inject_pool as u64,
            sar_pool_offset: offsets.sar_pool as u64,
            peer_data_offset: offsets.peer_data as u64,
            lock: SpinLock::new(),
            _pad1: [0; 4],
            cmd_credit: AtomicU64::new(config.ring_capacity as u64),
            _pad2: [0; 16],
        };
        header.lock.init();

        Ok(Self {
            backing,
            offsets,
            cmd_ring,
            resp_ring,
            inject_pool,
            sar_pool,
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.backing.region()
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        // SAFETY: validated at create/open, immutable afterwards except for
        // the atomics and the lock. The backing outlives self, so the
        // reference outlives the transient Region view.
        unsafe { &*self.region().offset(0).cast::<RegionHeader>() }
    }

    /// Acquire the region lock. Lock order with the local completion sink is
    /// always region first, sink second.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        self.header().lock.lock()
    }

    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid
    }

    pub fn offsets(&self) -> &RegionOffsets {
        &self.offsets
    }

    #[inline]
    pub fn cmd_ring(&self) -> &SlotRing<Cmd> {
        &self.cmd_ring
    }

    #[inline]
    pub fn resp_ring(&self) -> &SlotRing<Resp> {
        &self.resp_ring
    }

    #[inline]
    pub fn inject_pool(&self) -> &FreeStack {
        &self.inject_pool
    }

    #[inline]
    pub fn sar_pool(&self) -> &FreeStack {
        &self.sar_pool
    }

    /// Available command credit. Caller holds the region lock.
    pub fn cmd_credit(&self) -> u64 {
        self.header().cmd_credit.load(Ordering::Relaxed)
    }

    /// Take `n` credits, or fail without taking any. Caller holds the region
    /// lock; the take happens in lock-step with the slot commits under the
    /// same lock hold.
    pub fn try_take_credit(&self, n: u64) -> bool {
        let credit = self.header().cmd_credit.load(Ordering::Relaxed);
        if credit < n {
            return false;
        }
        self.header().cmd_credit.store(credit - n, Ordering::Relaxed);
        true
    }

    /// Take credits the admission gate already checked for. Caller holds the
    /// region lock continuously since that check.
    pub fn take_credit(&self, n: u64) {
        let credit = self.header().cmd_credit.load(Ordering::Relaxed);
        debug_assert!(credit >= n, "credit underflow");
        self.header()
            .cmd_credit
            .store(credit.saturating_sub(n), Ordering::Relaxed);
    }

    /// Return credits after the owner consumed commands. Called by the
    /// owner's progress side under the region lock.
    pub fn return_credit(&self, n: u64) {
        self.header().cmd_credit.fetch_add(n, Ordering::Relaxed);
    }

    /// Per-peer entry. `id` is an index into the owner's peer table.
    pub fn peer_data(&self, id: usize) -> &PeerData {
        assert!((id as u32) < self.header().max_peers, "peer id out of range");
        let off = self.offsets.peer_data + id * core::mem::size_of::<PeerData>();
        // SAFETY: bounds follow from the validated layout; the entry is
        // atomics plus a field written only under the region lock. The
        // backing outlives self.
        unsafe { &*self.region().offset(off).cast::<PeerData>() }
    }
}
