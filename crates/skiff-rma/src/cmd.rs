//! Command-slot wire format.
//!
//! A command occupies one fixed 384-byte ring slot: a 64-byte header followed
//! by a 320-byte payload area. The header's `payload_kind` discriminant says
//! which typed descriptor lives in the payload area; decoding always goes
//! through that discriminant, never through the opcode alone.
//!
//! Small operations embed their RMA target list in the payload descriptor and
//! take exactly one slot. Larger strategies take two slots: the descriptor,
//! then a standalone target-list slot.
//!
//! Shared structures carry region offsets, never pointers. The two sides of a
//! region map it at different addresses.

use bitflags::bitflags;

use crate::config::RMA_IOV_LIMIT;

/// Size of one command ring slot.
pub const CMD_SIZE: usize = 384;
/// Bytes available after the header.
pub const CMD_PAYLOAD_SIZE: usize = CMD_SIZE - core::mem::size_of::<CmdHeader>();
/// Largest payload an inline command can carry.
pub const INLINE_CAPACITY: usize = CMD_PAYLOAD_SIZE - core::mem::size_of::<RmaIovBlock>();

// ============================================================================
// Header
// ============================================================================

/// Operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RmaOp {
    /// Deliver data into the target's registered memory.
    Write = 0,
    /// Ask the target to produce data from its registered memory.
    ReadReq = 1,
    /// Data already placed by the initiator; target only accounts for it.
    WriteAck = 2,
    /// Read satisfied by the initiator directly; target produces nothing.
    ReadAck = 3,
}

impl RmaOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Write),
            1 => Some(Self::ReadReq),
            2 => Some(Self::WriteAck),
            3 => Some(Self::ReadAck),
            _ => None,
        }
    }

    /// Ack form of the same direction, used by the fast path after the data
    /// has already moved.
    pub fn to_ack(self) -> Self {
        match self {
            Self::Write | Self::WriteAck => Self::WriteAck,
            Self::ReadReq | Self::ReadAck => Self::ReadAck,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::ReadReq | Self::ReadAck)
    }
}

/// Memory domain of the local buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum MemKind {
    #[default]
    System = 0,
    Cuda = 1,
    Rocr = 2,
    Ze = 3,
}

impl MemKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::System),
            1 => Some(Self::Cuda),
            2 => Some(Self::Rocr),
            3 => Some(Self::Ze),
            _ => None,
        }
    }

    pub fn is_device(self) -> bool {
        !matches!(self, Self::System)
    }
}

bitflags! {
    /// Per-operation flags echoed to the target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Carry `cq_data` to the target's completion.
        const REMOTE_CQ_DATA = 1 << 0;
        /// Initiator completion must wait for target-side delivery.
        const DELIVERY_COMPLETE = 1 << 1;
        /// Target must post a response slot when done (deferred reads).
        const RMA_RESP = 1 << 2;
    }
}

/// Discriminant for the payload area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadKind {
    /// No payload descriptor (ack-only commands).
    None = 0,
    Inline = 1,
    Inject = 2,
    Iov = 3,
    Ipc = 4,
    Sar = 5,
    Mmap = 6,
    /// Standalone RMA target list (second slot of two-slot strategies).
    RmaList = 7,
}

impl PayloadKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Inline),
            2 => Some(Self::Inject),
            3 => Some(Self::Iov),
            4 => Some(Self::Ipc),
            5 => Some(Self::Sar),
            6 => Some(Self::Mmap),
            7 => Some(Self::RmaList),
            _ => None,
        }
    }
}

/// Fixed 64-byte command header.
#[derive(Debug)]
#[repr(C)]
pub struct CmdHeader {
    /// Sender's id in the receiver's peer table, -1 if unknown.
    pub peer_id: i32,
    /// Raw [`RmaOp`].
    pub op: u32,
    /// Raw [`PayloadKind`].
    pub payload_kind: u32,
    /// Raw [`OpFlags`].
    pub op_flags: u32,
    /// Total transfer length in bytes.
    pub size: u64,
    /// Remote completion data, valid with `REMOTE_CQ_DATA`.
    pub cq_data: u64,
    /// Offset of the reserved response slot in the sender's region, valid
    /// with `RMA_RESP`.
    pub resp_offset: u64,
    /// Device ordinal for device memory.
    pub device: u64,
    /// Raw [`MemKind`].
    pub mem_kind: u32,
    _pad: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<CmdHeader>() == 64);

impl CmdHeader {
    pub fn op(&self) -> Option<RmaOp> {
        RmaOp::from_raw(self.op)
    }

    pub fn flags(&self) -> OpFlags {
        OpFlags::from_bits_truncate(self.op_flags)
    }

    pub fn mem_kind(&self) -> Option<MemKind> {
        MemKind::from_raw(self.mem_kind)
    }
}

// ============================================================================
// RMA target lists
// ============================================================================

/// One remote target triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RmaIov {
    /// Registered virtual address on the target.
    pub addr: u64,
    pub len: u64,
    /// Registration key the target validates.
    pub key: u64,
}

const _: () = assert!(core::mem::size_of::<RmaIov>() == 24);

/// Bounded RMA target list in wire form.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RmaIovBlock {
    pub count: u64,
    pub iov: [RmaIov; RMA_IOV_LIMIT],
}

const _: () = assert!(core::mem::size_of::<RmaIovBlock>() == 104);

impl RmaIovBlock {
    pub fn from_slice(iov: &[RmaIov]) -> Self {
        debug_assert!(iov.len() <= RMA_IOV_LIMIT);
        let mut block = Self {
            count: iov.len() as u64,
            iov: [RmaIov::default(); RMA_IOV_LIMIT],
        };
        block.iov[..iov.len()].copy_from_slice(iov);
        block
    }

    pub fn as_slice(&self) -> &[RmaIov] {
        &self.iov[..(self.count as usize).min(RMA_IOV_LIMIT)]
    }

    pub fn total_len(&self) -> u64 {
        self.as_slice().iter().map(|e| e.len).sum()
    }
}

/// One local address/length pair in wire form.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IovPair {
    pub base: u64,
    pub len: u64,
}

// ============================================================================
// Payload descriptors
// ============================================================================

/// Payload data carried in the command slot itself.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InlineDesc {
    pub rma: RmaIovBlock,
    pub data: [u8; INLINE_CAPACITY],
}

const _: () = assert!(core::mem::size_of::<InlineDesc>() == CMD_PAYLOAD_SIZE);

/// Payload staged through a buffer in the target's inject pool.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InjectDesc {
    pub rma: RmaIovBlock,
    /// Offset of the staged buffer in the target's region.
    pub buf_offset: u64,
}

const _: () = assert!(core::mem::size_of::<InjectDesc>() <= CMD_PAYLOAD_SIZE);

/// Initiator-exposed local buffers for a direct cross-process copy driven by
/// the target.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IovDesc {
    /// Initiator's process id.
    pub pid: u64,
    pub count: u64,
    pub iov: [IovPair; RMA_IOV_LIMIT],
}

const _: () = assert!(core::mem::size_of::<IovDesc>() <= CMD_PAYLOAD_SIZE);

/// Opaque device IPC handle the target reopens in its own address space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IpcDesc {
    pub handle: [u8; 64],
    /// Offset of the transfer base within the reopened mapping.
    pub base_offset: u64,
    pub len: u64,
}

const _: () = assert!(core::mem::size_of::<IpcDesc>() <= CMD_PAYLOAD_SIZE);

/// Staging chunks in the sender's segment-and-reassemble pool.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SarDesc {
    pub count: u64,
    /// Offsets of the staged chunks in the sender's region.
    pub bufs: [u64; RMA_IOV_LIMIT],
}

const _: () = assert!(core::mem::size_of::<SarDesc>() <= CMD_PAYLOAD_SIZE);

/// Named memory-mapped file the target maps to move the payload.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MmapDesc {
    /// NUL-padded shared-memory object name.
    pub name: [u8; 64],
    pub len: u64,
}

const _: () = assert!(core::mem::size_of::<MmapDesc>() <= CMD_PAYLOAD_SIZE);

// ============================================================================
// Command slot
// ============================================================================

/// One command ring slot.
#[repr(C, align(64))]
pub struct Cmd {
    pub header: CmdHeader,
    payload: [u8; CMD_PAYLOAD_SIZE],
}

const _: () = assert!(core::mem::size_of::<Cmd>() == CMD_SIZE);

/// Typed view of a decoded payload area.
#[derive(Debug)]
pub enum Payload<'a> {
    None,
    Inline(&'a InlineDesc),
    Inject(&'a InjectDesc),
    Iov(&'a IovDesc),
    Ipc(&'a IpcDesc),
    Sar(&'a SarDesc),
    Mmap(&'a MmapDesc),
    RmaList(&'a RmaIovBlock),
}

/// Command that cannot be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdDecodeError(pub &'static str);

impl std::fmt::Display for CmdDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed command: {}", self.0)
    }
}

impl std::error::Error for CmdDecodeError {}

impl Cmd {
    /// Fill the header. Payload descriptors are written separately.
    #[allow(clippy::too_many_arguments)]
    pub fn format_header(
        &mut self,
        peer_id: i32,
        op: RmaOp,
        payload_kind: PayloadKind,
        flags: OpFlags,
        size: u64,
        cq_data: u64,
        mem_kind: MemKind,
        device: u64,
    ) {
        self.header = CmdHeader {
            peer_id,
            op: op as u32,
            payload_kind: payload_kind as u32,
            op_flags: flags.bits(),
            size,
            cq_data,
            resp_offset: 0,
            device,
            mem_kind: mem_kind as u32,
            _pad: [0; 12],
        };
    }

    fn write_payload<T: Copy>(&mut self, desc: &T) {
        debug_assert!(core::mem::size_of::<T>() <= CMD_PAYLOAD_SIZE);
        // Descriptors are plain repr(C) data; the payload area is large
        // enough by the size asserts above.
        unsafe {
            core::ptr::write_unaligned(self.payload.as_mut_ptr().cast::<T>(), *desc);
        }
    }

    fn read_payload<T>(&self) -> &T {
        debug_assert!(core::mem::size_of::<T>() <= CMD_PAYLOAD_SIZE);
        debug_assert!(self.payload.as_ptr() as usize % core::mem::align_of::<T>() == 0);
        unsafe { &*self.payload.as_ptr().cast::<T>() }
    }

    pub fn set_inline(&mut self, desc: &InlineDesc) {
        self.write_payload(desc);
    }

    pub fn set_inject(&mut self, desc: &InjectDesc) {
        self.write_payload(desc);
    }

    pub fn set_iov(&mut self, desc: &IovDesc) {
        self.write_payload(desc);
    }

    pub fn set_ipc(&mut self, desc: &IpcDesc) {
        self.write_payload(desc);
    }

    pub fn set_sar(&mut self, desc: &SarDesc) {
        self.write_payload(desc);
    }

    pub fn set_mmap(&mut self, desc: &MmapDesc) {
        self.write_payload(desc);
    }

    pub fn set_rma_list(&mut self, block: &RmaIovBlock) {
        self.write_payload(block);
    }

    /// Interpret the payload area by the header discriminant.
    pub fn decode(&self) -> Result<Payload<'_>, CmdDecodeError> {
        let kind = PayloadKind::from_raw(self.header.payload_kind)
            .ok_or(CmdDecodeError("unknown payload kind"))?;
        Ok(match kind {
            PayloadKind::None => Payload::None,
            PayloadKind::Inline => Payload::Inline(self.read_payload()),
            PayloadKind::Inject => Payload::Inject(self.read_payload()),
            PayloadKind::Iov => Payload::Iov(self.read_payload()),
            PayloadKind::Ipc => Payload::Ipc(self.read_payload()),
            PayloadKind::Sar => Payload::Sar(self.read_payload()),
            PayloadKind::Mmap => Payload::Mmap(self.read_payload()),
            PayloadKind::RmaList => Payload::RmaList(self.read_payload()),
        })
    }
}

// ============================================================================
// Response slot
// ============================================================================

/// Status value meaning "not yet completed by the target".
pub const RESP_BUSY: i64 = i64::MIN;

/// One response ring slot, written by the target when a deferred operation
/// finishes. `msg_id` is the initiator's pending-tracker index, never a
/// pointer.
#[derive(Debug)]
#[repr(C)]
pub struct Resp {
    pub msg_id: u64,
    pub status: i64,
}

const _: () = assert!(core::mem::size_of::<Resp>() == 16);
