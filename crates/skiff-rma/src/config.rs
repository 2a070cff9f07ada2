use crate::cmd::INLINE_CAPACITY;

/// Fixed per-operation bound on scatter/gather and RMA-target list lengths.
///
/// Exceeding it is a caller-contract violation, asserted at the façade, not
/// a runtime error path. The limit is baked into command slot layouts and
/// must be identical on both sides of a shared region.
pub const RMA_IOV_LIMIT: usize = 4;

/// Upper bound on the peer-data array in a region.
pub const MAX_PEERS: u32 = 64;

/// Engine tunables.
///
/// Thresholds select among data-movement strategies; they are configuration,
/// not constants, but every value echoed into a region header must match on
/// both sides of that region (validated when attaching).
#[derive(Debug, Clone)]
pub struct RmaConfig {
    /// Command/response ring capacity (power of 2).
    pub ring_capacity: u32,
    /// Largest payload copied directly into a command slot. At most
    /// [`INLINE_CAPACITY`].
    pub inline_size: u32,
    /// Largest payload staged through an inject buffer; also the inject pool
    /// slot size. Must be >= `inline_size`.
    pub inject_size: u32,
    /// Number of inject-pool buffers.
    pub inject_count: u32,
    /// Largest host-memory payload preferred through segment-and-reassemble
    /// when the cross-process copy is unavailable; above this the
    /// memory-mapped fallback is used instead.
    pub sar_threshold: usize,
    /// Size of one SAR staging chunk; also the SAR pool slot size.
    pub sar_chunk_size: u32,
    /// Number of SAR staging chunks.
    pub sar_count: u32,
    /// Capacity of the local pending-completion tracker.
    pub pending_count: u32,
    /// Enable the synchronous fast path when a direct cross-process copy is
    /// available.
    pub fast_rma: bool,
    /// Size of the per-peer array in the region.
    pub max_peers: u32,
}

impl Default for RmaConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            inline_size: INLINE_CAPACITY as u32,
            inject_size: 4096,
            inject_count: 64,
            sar_threshold: 32768,
            sar_chunk_size: 16384,
            sar_count: 32,
            pending_count: 256,
            fast_rma: true,
            max_peers: MAX_PEERS,
        }
    }
}

impl RmaConfig {
    /// Validate tunable consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_capacity.is_power_of_two() || self.ring_capacity == 0 {
            return Err(ConfigError("ring_capacity must be a non-zero power of 2"));
        }
        if self.inline_size as usize > INLINE_CAPACITY {
            return Err(ConfigError("inline_size exceeds command slot capacity"));
        }
        if self.inject_size < self.inline_size {
            return Err(ConfigError("inject_size must be >= inline_size"));
        }
        if self.inject_count == 0 || self.sar_count == 0 || self.pending_count == 0 {
            return Err(ConfigError("pool sizes must be > 0"));
        }
        if self.sar_chunk_size == 0 {
            return Err(ConfigError("sar_chunk_size must be > 0"));
        }
        if self.max_peers == 0 || self.max_peers > MAX_PEERS {
            return Err(ConfigError("max_peers out of range"));
        }
        Ok(())
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError(pub &'static str);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid config: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
