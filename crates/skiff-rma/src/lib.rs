//! Shared-memory RMA transmit engine.
//!
//! Peers on one host exchange one-sided reads and writes through mapped
//! regions. Each endpoint owns a region holding the command ring, inject
//! pool and credit counter for traffic *toward* it; issuing an operation
//! means locking the destination's region, picking a data-movement strategy
//! by size and capability, committing one or two command slots, and either
//! completing synchronously or parking a pending entry until the peer's
//! response.
//!
//! Strategies, smallest to largest: a direct cross-process copy with an
//! ack-only command, payload inlined in the command slot, payload staged in
//! the destination's inject pool, target-driven cross-process copy, device
//! IPC handles, segment-and-reassemble through the sender's staging pool,
//! and a named shared mapping for oversized transfers.
//!
//! Every admission is all-or-nothing. Ring, pool, credit or tracker
//! exhaustion unwinds completely and reports [`RmaError::Again`]; the caller
//! retries after peer progress.

pub mod cmd;
pub mod collab;
pub mod config;
pub mod engine;
pub mod ep;
pub mod error;
pub mod layout;
pub mod peer;
pub mod pending;

pub use cmd::{MemKind, OpFlags, Payload, RmaIov, RmaOp};
pub use collab::{
    CompletionSink, CopyDir, CrossCopy, DeviceIpc, Iov, NoCrossCopy, NoDeviceIpc, NoSignal,
    PeerSignal, ProcessVmCopy,
};
pub use config::{ConfigError, RmaConfig, RMA_IOV_LIMIT};
pub use engine::{MemDesc, RmaEngine};
pub use ep::{RmaEndpoint, RmaMsg};
pub use error::{Disposition, RmaError};
pub use layout::{RegionError, RmaRegion};
