//! Endpoint-facing operation surface.
//!
//! Thin wrappers that shape each call into the generic transmit path: the
//! vector variants collapse their fragments into a single remote triple
//! spanning the same total, the `*data` variants force remote completion
//! data, and the inject variants bound the payload and skip the completion
//! entry.

use std::sync::Arc;

use crate::cmd::{MemKind, OpFlags, RmaIov, RmaOp};
use crate::collab::{CompletionSink, CrossCopy, DeviceIpc, Iov, PeerSignal};
use crate::config::{ConfigError, RmaConfig};
use crate::engine::{MemDesc, RmaEngine};
use crate::error::{Disposition, RmaError};
use crate::layout::RmaRegion;

/// Fully specified operation, the `*msg` form.
pub struct RmaMsg<'a> {
    pub iov: &'a [Iov],
    pub rma: &'a [RmaIov],
    pub addr: i32,
    pub context: usize,
    pub cq_data: u64,
    pub mem: MemDesc,
}

/// One endpoint's RMA surface.
pub struct RmaEndpoint {
    engine: RmaEngine,
    /// Flags applied to every non-`msg` operation.
    tx_flags: OpFlags,
}

impl RmaEndpoint {
    pub fn new(
        config: RmaConfig,
        region: Arc<RmaRegion>,
        cq: Box<dyn CompletionSink>,
        copy: Box<dyn CrossCopy>,
        ipc: Box<dyn DeviceIpc>,
        signal: Box<dyn PeerSignal>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            engine: RmaEngine::new(config, region, cq, copy, ipc, signal)?,
            tx_flags: OpFlags::empty(),
        })
    }

    pub fn set_tx_flags(&mut self, flags: OpFlags) {
        self.tx_flags = flags;
    }

    pub fn engine(&self) -> &RmaEngine {
        &self.engine
    }

    pub fn add_peer(&self, id: i32, remote_id: i32, region: Arc<RmaRegion>) {
        self.engine.add_peer(id, remote_id, region);
    }

    pub fn remove_peer(&self, id: i32) {
        self.engine.remove_peer(id);
    }

    /// Retire completed deferred operations.
    pub fn drain_responses(&self) -> usize {
        self.engine.drain_responses()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn read(
        &self,
        buf: &mut [u8],
        addr: i32,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> Result<Disposition, RmaError> {
        let iov = [Iov {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }];
        let rma = [RmaIov {
            addr: remote_addr,
            len: buf.len() as u64,
            key,
        }];
        self.engine.generic_rma(
            &iov,
            &rma,
            addr,
            context,
            RmaOp::ReadReq,
            0,
            self.tx_flags,
            MemDesc::default(),
        )
    }

    pub fn readv(
        &self,
        iov: &[Iov],
        addr: i32,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> Result<Disposition, RmaError> {
        let rma = [RmaIov {
            addr: remote_addr,
            len: Iov::total(iov) as u64,
            key,
        }];
        self.engine.generic_rma(
            iov,
            &rma,
            addr,
            context,
            RmaOp::ReadReq,
            0,
            self.tx_flags,
            MemDesc::default(),
        )
    }

    pub fn readmsg(&self, msg: &RmaMsg<'_>, flags: OpFlags) -> Result<Disposition, RmaError> {
        self.engine.generic_rma(
            msg.iov,
            msg.rma,
            msg.addr,
            msg.context,
            RmaOp::ReadReq,
            0,
            flags | self.tx_flags,
            msg.mem,
        )
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn write(
        &self,
        buf: &[u8],
        addr: i32,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> Result<Disposition, RmaError> {
        let iov = [Iov {
            base: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }];
        let rma = [RmaIov {
            addr: remote_addr,
            len: buf.len() as u64,
            key,
        }];
        self.engine.generic_rma(
            &iov,
            &rma,
            addr,
            context,
            RmaOp::Write,
            0,
            self.tx_flags,
            MemDesc::default(),
        )
    }

    pub fn writev(
        &self,
        iov: &[Iov],
        addr: i32,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> Result<Disposition, RmaError> {
        let rma = [RmaIov {
            addr: remote_addr,
            len: Iov::total(iov) as u64,
            key,
        }];
        self.engine.generic_rma(
            iov,
            &rma,
            addr,
            context,
            RmaOp::Write,
            0,
            self.tx_flags,
            MemDesc::default(),
        )
    }

    pub fn writemsg(&self, msg: &RmaMsg<'_>, flags: OpFlags) -> Result<Disposition, RmaError> {
        self.engine.generic_rma(
            msg.iov,
            msg.rma,
            msg.addr,
            msg.context,
            RmaOp::Write,
            msg.cq_data,
            flags | self.tx_flags,
            msg.mem,
        )
    }

    /// Write that always delivers `cq_data` to the target's completion.
    #[allow(clippy::too_many_arguments)]
    pub fn writedata(
        &self,
        buf: &[u8],
        cq_data: u64,
        addr: i32,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> Result<Disposition, RmaError> {
        let iov = [Iov {
            base: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }];
        let rma = [RmaIov {
            addr: remote_addr,
            len: buf.len() as u64,
            key,
        }];
        self.engine.generic_rma(
            &iov,
            &rma,
            addr,
            context,
            RmaOp::Write,
            cq_data,
            OpFlags::REMOTE_CQ_DATA | self.tx_flags,
            MemDesc {
                kind: MemKind::System,
                device: 0,
                device_only: false,
            },
        )
    }

    // ========================================================================
    // Injects
    // ========================================================================

    /// Small write with no completion entry; `buf` is reusable on return.
    pub fn inject(
        &self,
        buf: &[u8],
        addr: i32,
        remote_addr: u64,
        key: u64,
    ) -> Result<(), RmaError> {
        self.engine.generic_rma_inject(
            buf,
            addr,
            RmaIov {
                addr: remote_addr,
                len: buf.len() as u64,
                key,
            },
            0,
            OpFlags::empty(),
        )
    }

    /// Inject that delivers `cq_data` to the target's completion.
    pub fn inject_writedata(
        &self,
        buf: &[u8],
        cq_data: u64,
        addr: i32,
        remote_addr: u64,
        key: u64,
    ) -> Result<(), RmaError> {
        self.engine.generic_rma_inject(
            buf,
            addr,
            RmaIov {
                addr: remote_addr,
                len: buf.len() as u64,
                key,
            },
            cq_data,
            OpFlags::REMOTE_CQ_DATA,
        )
    }
}
