//! The transmit engine.
//!
//! One call, one operation, one outcome: either the whole operation is
//! admitted (its commands committed, its credit taken, its resources held)
//! or nothing changed and the caller gets retryable busy. There is no
//! partially admitted state.
//!
//! Lock order is fixed: peer region spinlock first, local tx lock second,
//! released in reverse. The tx lock also serializes our own pending tracker,
//! staging pool and response-ring cursors, which only this process mutates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::cmd::{
    Cmd, InjectDesc, InlineDesc, IovDesc, IovPair, IpcDesc, MemKind, MmapDesc, OpFlags,
    PayloadKind, RmaIov, RmaIovBlock, RmaOp, SarDesc, INLINE_CAPACITY, RESP_BUSY,
};
use crate::collab::{CompletionSink, CopyDir, CrossCopy, DeviceIpc, Iov, PeerSignal};
use crate::config::{ConfigError, RmaConfig, RMA_IOV_LIMIT};
use crate::error::{Disposition, RmaError};
use crate::layout::RmaRegion;
use crate::peer::PeerTable;
use crate::pending::{MmapStage, PendingEntry, PendingPool, StagedResource};

/// Properties of the local buffers' memory registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemDesc {
    pub kind: MemKind,
    pub device: u64,
    /// Registration is usable only on the device, so host staging must be
    /// avoided when a device handle can be exported.
    pub device_only: bool,
}

struct TxShared {
    cq: Box<dyn CompletionSink>,
    pending: PendingPool,
}

/// One endpoint's transmit side.
pub struct RmaEngine {
    config: RmaConfig,
    region: Arc<RmaRegion>,
    peers: RwLock<PeerTable>,
    tx: Mutex<TxShared>,
    copy: Box<dyn CrossCopy>,
    ipc: Box<dyn DeviceIpc>,
    signal: Box<dyn PeerSignal>,
    mmap_seq: AtomicU64,
}

static_assertions::assert_impl_all!(RmaEngine: Send, Sync);

impl RmaEngine {
    pub fn new(
        config: RmaConfig,
        region: Arc<RmaRegion>,
        cq: Box<dyn CompletionSink>,
        copy: Box<dyn CrossCopy>,
        ipc: Box<dyn DeviceIpc>,
        signal: Box<dyn PeerSignal>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let peers = RwLock::new(PeerTable::new(config.max_peers));
        let pending = PendingPool::new(config.pending_count);
        Ok(Self {
            config,
            region,
            peers,
            tx: Mutex::new(TxShared { cq, pending }),
            copy,
            ipc,
            signal,
            mmap_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RmaConfig {
        &self.config
    }

    pub fn region(&self) -> &Arc<RmaRegion> {
        &self.region
    }

    /// Complete resolution of a peer address.
    pub fn add_peer(&self, id: i32, remote_id: i32, region: Arc<RmaRegion>) {
        self.peers.write().insert(id, remote_id, region);
    }

    pub fn remove_peer(&self, id: i32) {
        self.peers.write().remove(id);
    }

    fn resolved(&self, id: i32) -> Option<(u32, i32, Arc<RmaRegion>)> {
        let peers = self.peers.read();
        let peer = peers.resolve(id)?;
        Some((peer.pid, peer.remote_id, Arc::clone(&peer.region)))
    }

    // ========================================================================
    // Generic path
    // ========================================================================

    /// Issue one RMA operation toward `addr`.
    ///
    /// `iov` and `rma` describe the same byte stream from the two sides;
    /// their totals must match and their lengths are bounded by
    /// [`RMA_IOV_LIMIT`]. On success the returned disposition says whether
    /// the completion was already posted or waits on the peer's response.
    #[allow(clippy::too_many_arguments)]
    pub fn generic_rma(
        &self,
        iov: &[Iov],
        rma: &[RmaIov],
        addr: i32,
        context: usize,
        op: RmaOp,
        cq_data: u64,
        flags: OpFlags,
        mem: MemDesc,
    ) -> Result<Disposition, RmaError> {
        assert!(iov.len() <= RMA_IOV_LIMIT, "iov list too long");
        assert!(rma.len() <= RMA_IOV_LIMIT, "rma list too long");
        let total = Iov::total(iov);
        assert_eq!(
            total as u64,
            rma.iter().map(|e| e.len).sum::<u64>(),
            "iov and rma totals disagree"
        );

        let (pid, remote_id, peer_region) = self.resolved(addr).ok_or(RmaError::Again)?;

        let use_ipc = mem.kind.is_device()
            && mem.device_only
            && iov.len() == 1
            && self.ipc.ipc_enabled(mem.kind);

        let fast = self.config.fast_rma
            && !flags.intersects(OpFlags::REMOTE_CQ_DATA | OpFlags::DELIVERY_COMPLETE)
            && rma.len() == 1
            && !mem.kind.is_device()
            && self.copy.available(pid);

        let single_slot = fast
            || (total <= self.config.inject_size as usize
                && !flags.contains(OpFlags::DELIVERY_COMPLETE)
                && !use_ipc
                && !mem.kind.is_device());
        let cmds: u64 = if single_slot { 1 } else { 2 };

        let region_guard = peer_region.lock();
        if peer_region.cmd_credit() < cmds || self.region.peer_data(addr as usize).sar_active() {
            return Err(RmaError::Again);
        }

        let mut tx = self.tx.lock();
        if tx.cq.is_full() {
            return Err(RmaError::Again);
        }

        let cmd_ring = peer_region.cmd_ring();
        // Credit comes from the peer and the peer is not trusted; the ring's
        // own counters are the final word on space for every slot of this
        // command, checked before anything is written.
        if (cmd_ring.capacity() as u64) < cmd_ring.len().saturating_add(cmds) {
            return Err(RmaError::Again);
        }
        // Peek only: nothing below is visible to the peer until commit.
        let Some(cmd) = (unsafe { cmd_ring.next_tx() }) else {
            return Err(RmaError::Again);
        };

        let mut deferred = false;

        if fast {
            self.rma_fast(pid, remote_id, cmd, iov, rma, op, flags, cq_data, total)?;
        } else if single_slot && op == RmaOp::Write && total <= self.config.inline_size as usize {
            cmd.format_header(
                remote_id,
                op,
                PayloadKind::Inline,
                flags,
                total as u64,
                cq_data,
                mem.kind,
                mem.device,
            );
            let mut desc = InlineDesc {
                rma: RmaIovBlock::from_slice(rma),
                data: [0; INLINE_CAPACITY],
            };
            copy_from_iov(iov, 0, desc.data.as_mut_ptr(), total);
            cmd.set_inline(&desc);
        } else if single_slot {
            let Some(buf) = (unsafe { peer_region.inject_pool().acquire() }) else {
                return Err(RmaError::Again);
            };
            cmd.format_header(
                remote_id,
                op,
                PayloadKind::Inject,
                flags,
                total as u64,
                cq_data,
                mem.kind,
                mem.device,
            );
            cmd.set_inject(&InjectDesc {
                rma: RmaIovBlock::from_slice(rma),
                buf_offset: peer_region.inject_pool().data_offset(buf) as u64,
            });
            if op == RmaOp::ReadReq {
                // The buffer is where the peer deposits the data; completion
                // waits for its response.
                match self.reserve_pending(
                    &mut tx,
                    cmd,
                    iov,
                    addr,
                    context,
                    op,
                    flags,
                    mem,
                    total,
                    StagedResource::Inject { index: buf },
                ) {
                    Ok(()) => deferred = true,
                    Err(e) => {
                        // SAFETY: buffer was taken under this lock hold.
                        unsafe { peer_region.inject_pool().release(buf) };
                        return Err(e);
                    }
                }
            } else {
                // SAFETY: index just acquired; the slot is ours until the
                // command referencing it is committed.
                copy_from_iov(iov, 0, unsafe { peer_region.inject_pool().data_ptr(buf) }, total);
            }
        } else {
            let resource = self.stage_bulk(
                pid,
                remote_id,
                cmd,
                iov,
                op,
                flags,
                cq_data,
                mem,
                total,
                use_ipc,
            )?;
            self.reserve_pending(
                &mut tx, cmd, iov, addr, context, op, flags, mem, total, resource,
            )?;
            deferred = true;
        }

        // Commit point. Everything after this is infallible.
        unsafe { cmd_ring.commit_tx() };
        peer_region.take_credit(1);

        if !single_slot {
            // Space for this slot was verified against the ring's counters
            // before the first commit and the lock has been held since, so
            // the peek cannot fail.
            let Some(list_slot) = (unsafe { cmd_ring.next_tx() }) else {
                unreachable!("ring space verified for both slots");
            };
            list_slot.format_header(
                remote_id,
                op,
                PayloadKind::RmaList,
                OpFlags::empty(),
                total as u64,
                0,
                mem.kind,
                mem.device,
            );
            list_slot.set_rma_list(&RmaIovBlock::from_slice(rma));
            unsafe { cmd_ring.commit_tx() };
            peer_region.take_credit(1);
        }

        self.signal.signal(addr);

        if !deferred {
            // The completion names the caller's operation even when the fast
            // path rewrote the wire opcode to its ack form.
            tx.cq.post(context, op, flags, 0);
        }

        drop(tx);
        drop(region_guard);
        trace!(peer = addr, ?op, total, deferred, "rma admitted");
        Ok(if deferred {
            Disposition::Deferred
        } else {
            Disposition::Sync
        })
    }

    // ========================================================================
    // Inject path
    // ========================================================================

    /// Issue a small write without a completion entry. The payload is fully
    /// consumed before return; `buf` may be reused immediately.
    pub fn generic_rma_inject(
        &self,
        buf: &[u8],
        addr: i32,
        rma: RmaIov,
        cq_data: u64,
        flags: OpFlags,
    ) -> Result<(), RmaError> {
        assert!(buf.len() <= self.config.inject_size as usize, "inject too large");
        assert_eq!(buf.len() as u64, rma.len, "iov and rma totals disagree");

        let (pid, remote_id, peer_region) = self.resolved(addr).ok_or(RmaError::Again)?;

        let fast = self.config.fast_rma
            && !flags.contains(OpFlags::REMOTE_CQ_DATA)
            && self.copy.available(pid);

        let region_guard = peer_region.lock();
        if peer_region.cmd_credit() < 1 || self.region.peer_data(addr as usize).sar_active() {
            return Err(RmaError::Again);
        }

        let iov = [Iov {
            base: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }];

        let cmd_ring = peer_region.cmd_ring();
        let Some(cmd) = (unsafe { cmd_ring.next_tx() }) else {
            return Err(RmaError::Again);
        };

        if fast {
            self.rma_fast(
                pid,
                remote_id,
                cmd,
                &iov,
                &[rma],
                RmaOp::Write,
                flags,
                cq_data,
                buf.len(),
            )?;
        } else if buf.len() <= self.config.inline_size as usize {
            cmd.format_header(
                remote_id,
                RmaOp::Write,
                PayloadKind::Inline,
                flags,
                buf.len() as u64,
                cq_data,
                MemKind::System,
                0,
            );
            let mut desc = InlineDesc {
                rma: RmaIovBlock::from_slice(&[rma]),
                data: [0; INLINE_CAPACITY],
            };
            desc.data[..buf.len()].copy_from_slice(buf);
            cmd.set_inline(&desc);
        } else {
            let Some(index) = (unsafe { peer_region.inject_pool().acquire() }) else {
                return Err(RmaError::Again);
            };
            cmd.format_header(
                remote_id,
                RmaOp::Write,
                PayloadKind::Inject,
                flags,
                buf.len() as u64,
                cq_data,
                MemKind::System,
                0,
            );
            cmd.set_inject(&InjectDesc {
                rma: RmaIovBlock::from_slice(&[rma]),
                buf_offset: peer_region.inject_pool().data_offset(index) as u64,
            });
            // SAFETY: index just acquired under this lock hold.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    peer_region.inject_pool().data_ptr(index),
                    buf.len(),
                );
            }
        }

        unsafe { cmd_ring.commit_tx() };
        peer_region.take_credit(1);
        self.signal.signal(addr);

        self.tx.lock().cq.count_tx(RmaOp::Write);
        drop(region_guard);
        Ok(())
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Move the data now and send an ack-only command.
    #[allow(clippy::too_many_arguments)]
    fn rma_fast(
        &self,
        pid: u32,
        remote_id: i32,
        cmd: &mut Cmd,
        iov: &[Iov],
        rma: &[RmaIov],
        op: RmaOp,
        flags: OpFlags,
        cq_data: u64,
        total: usize,
    ) -> Result<(), RmaError> {
        let mut remote = [Iov::default(); RMA_IOV_LIMIT];
        for (dst, src) in remote.iter_mut().zip(rma) {
            dst.base = src.addr as *mut u8;
            dst.len = src.len as usize;
        }
        let dir = if op.is_read() {
            CopyDir::FromPeer
        } else {
            CopyDir::ToPeer
        };
        // A copy failure admits nothing; the slot stays uncommitted.
        self.copy
            .copy(pid, iov, &remote[..rma.len()], total, dir)
            .map_err(RmaError::Copy)?;

        cmd.format_header(
            remote_id,
            op.to_ack(),
            PayloadKind::RmaList,
            flags,
            total as u64,
            cq_data,
            MemKind::System,
            0,
        );
        cmd.set_rma_list(&RmaIovBlock::from_slice(rma));
        Ok(())
    }

    /// Stage a two-slot transfer's resources and format the first slot.
    /// Failures release everything they took and report retryable busy.
    #[allow(clippy::too_many_arguments)]
    fn stage_bulk(
        &self,
        pid: u32,
        remote_id: i32,
        cmd: &mut Cmd,
        iov: &[Iov],
        op: RmaOp,
        flags: OpFlags,
        cq_data: u64,
        mem: MemDesc,
        total: usize,
        use_ipc: bool,
    ) -> Result<StagedResource, RmaError> {
        if self.copy.available(pid) && mem.kind == MemKind::System {
            cmd.format_header(
                remote_id,
                op,
                PayloadKind::Iov,
                flags,
                total as u64,
                cq_data,
                mem.kind,
                mem.device,
            );
            let mut desc = IovDesc {
                pid: std::process::id() as u64,
                count: iov.len() as u64,
                iov: [IovPair::default(); RMA_IOV_LIMIT],
            };
            for (dst, src) in desc.iov.iter_mut().zip(iov) {
                dst.base = src.base as u64;
                dst.len = src.len as u64;
            }
            cmd.set_iov(&desc);
            return Ok(StagedResource::None);
        }

        if use_ipc {
            match self.ipc.export(mem.kind, mem.device, iov[0].base, total) {
                Ok((handle, base_offset)) => {
                    cmd.format_header(
                        remote_id,
                        op,
                        PayloadKind::Ipc,
                        flags,
                        total as u64,
                        cq_data,
                        mem.kind,
                        mem.device,
                    );
                    cmd.set_ipc(&IpcDesc {
                        handle,
                        base_offset,
                        len: total as u64,
                    });
                    return Ok(StagedResource::None);
                }
                Err(e) => {
                    warn!(kind = ?mem.kind, error = %e, "device ipc unusable, staging through host");
                }
            }
        }

        // Device payloads always segment through the staging pool: the named
        // mapping is host memory the initiator fills directly, which a device
        // pointer cannot feed. Host transfers segment up to one chunk window;
        // anything larger goes through the named mapping instead.
        let sar_window = RMA_IOV_LIMIT * self.config.sar_chunk_size as usize;
        if mem.kind.is_device() || (total <= sar_window && total <= self.config.sar_threshold) {
            self.stage_sar(cmd, iov, remote_id, op, flags, cq_data, mem, total)
        } else {
            self.stage_mmap(cmd, iov, remote_id, op, flags, cq_data, mem, total)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_sar(
        &self,
        cmd: &mut Cmd,
        iov: &[Iov],
        remote_id: i32,
        op: RmaOp,
        flags: OpFlags,
        cq_data: u64,
        mem: MemDesc,
        total: usize,
    ) -> Result<StagedResource, RmaError> {
        let chunk = self.config.sar_chunk_size as usize;
        let needed = total.div_ceil(chunk).min(RMA_IOV_LIMIT);

        // Our staging pool is mutated only by this process, serialized by
        // the tx lock the caller holds.
        let pool = self.region.sar_pool();
        let mut chunks = [0u32; RMA_IOV_LIMIT];
        let mut taken = 0;
        while taken < needed {
            match unsafe { pool.acquire() } {
                Some(index) => {
                    chunks[taken] = index;
                    taken += 1;
                }
                None => {
                    for &index in &chunks[..taken] {
                        unsafe { pool.release(index) };
                    }
                    return Err(RmaError::Again);
                }
            }
        }

        let mut desc = SarDesc {
            count: needed as u64,
            bufs: [0; RMA_IOV_LIMIT],
        };
        let mut staged = 0usize;
        for (slot, &index) in desc.bufs.iter_mut().zip(&chunks[..needed]) {
            *slot = pool.data_offset(index) as u64;
            if !op.is_read() && mem.kind == MemKind::System {
                let len = chunk.min(total - staged);
                // SAFETY: chunk just acquired, sized chunk bytes.
                copy_from_iov(iov, staged, unsafe { pool.data_ptr(index) }, len);
                staged += len;
            }
        }

        cmd.format_header(
            remote_id,
            op,
            PayloadKind::Sar,
            flags,
            total as u64,
            cq_data,
            mem.kind,
            mem.device,
        );
        cmd.set_sar(&desc);

        Ok(StagedResource::Sar {
            chunks,
            chunk_count: needed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_mmap(
        &self,
        cmd: &mut Cmd,
        iov: &[Iov],
        remote_id: i32,
        op: RmaOp,
        flags: OpFlags,
        cq_data: u64,
        mem: MemDesc,
        total: usize,
    ) -> Result<StagedResource, RmaError> {
        debug_assert_eq!(mem.kind, MemKind::System, "device payloads never stage here");
        let tag = self.mmap_seq.fetch_add(1, Ordering::Relaxed);
        let mut stage = match MmapStage::create(tag, total) {
            Ok(stage) => stage,
            Err(e) => {
                warn!(error = %e, "mmap staging failed");
                return Err(RmaError::Again);
            }
        };
        if !op.is_read() {
            copy_from_iov(iov, 0, stage.as_mut_slice().as_mut_ptr(), total);
        }

        cmd.format_header(
            remote_id,
            op,
            PayloadKind::Mmap,
            flags,
            total as u64,
            cq_data,
            mem.kind,
            mem.device,
        );
        cmd.set_mmap(&MmapDesc {
            name: stage.name(),
            len: total as u64,
        });

        Ok(StagedResource::Mmap(stage))
    }

    /// Reserve the response slot and pending entry a deferred operation
    /// needs, and mark the command as response-bearing.
    #[allow(clippy::too_many_arguments)]
    fn reserve_pending(
        &self,
        tx: &mut TxShared,
        cmd: &mut Cmd,
        iov: &[Iov],
        addr: i32,
        context: usize,
        op: RmaOp,
        flags: OpFlags,
        mem: MemDesc,
        total: usize,
        resource: StagedResource,
    ) -> Result<(), RmaError> {
        // Our response ring cursors are owner-only, serialized by the tx
        // lock the caller holds.
        let resp_ring = self.region.resp_ring();
        let Some(resp) = (unsafe { resp_ring.next_tx() }) else {
            self.release_resource(resource);
            return Err(RmaError::Again);
        };

        let is_sar = matches!(resource, StagedResource::Sar { .. });
        let mut bytes_done = 0;
        if !op.is_read() && mem.kind == MemKind::System {
            bytes_done = match &resource {
                StagedResource::Sar { chunk_count, .. } => {
                    total.min(chunk_count * self.config.sar_chunk_size as usize)
                }
                StagedResource::Mmap(_) => total,
                _ => 0,
            };
        }

        let mut entry = PendingEntry {
            context,
            op,
            flags,
            mem_kind: mem.kind,
            device: mem.device,
            peer_id: addr,
            iov: [Iov::default(); RMA_IOV_LIMIT],
            iov_count: iov.len(),
            total,
            bytes_done,
            resource,
        };
        entry.iov[..iov.len()].copy_from_slice(iov);

        let msg_id = match tx.pending.acquire(entry) {
            Ok(msg_id) => msg_id,
            Err(rejected) => {
                self.release_resource(rejected.resource);
                return Err(RmaError::Again);
            }
        };

        resp.msg_id = msg_id as u64;
        resp.status = RESP_BUSY;
        let resp_offset = resp_ring.slot_offset(resp) as u64;
        unsafe { resp_ring.commit_tx() };

        if is_sar {
            self.region.peer_data(addr as usize).set_sar_active();
        }

        cmd.header.op_flags |= OpFlags::RMA_RESP.bits();
        cmd.header.resp_offset = resp_offset;
        Ok(())
    }

    // ========================================================================
    // Response draining
    // ========================================================================

    /// Retire completed responses. Returns the number retired.
    ///
    /// Deferred reads copy their payload out of the staged buffer here;
    /// every staged resource goes back to its pool.
    pub fn drain_responses(&self) -> usize {
        let mut retired = 0;
        loop {
            let mut tx = self.tx.lock();
            let resp_ring = self.region.resp_ring();
            let Some(resp) = (unsafe { resp_ring.next_rx() }) else {
                break;
            };
            if resp.status == RESP_BUSY {
                break;
            }
            let msg_id = resp.msg_id as u32;
            let status = resp.status;
            unsafe { resp_ring.discard_rx() };

            let Some(mut entry) = tx.pending.complete(msg_id) else {
                warn!(msg_id, "response for unknown pending entry");
                continue;
            };

            // Staging-pool and gate bookkeeping under the tx lock; anything
            // touching a peer region waits until it is released.
            let after = match core::mem::replace(&mut entry.resource, StagedResource::None) {
                StagedResource::None => None,
                StagedResource::Sar {
                    chunks,
                    chunk_count,
                } => {
                    let pool = self.region.sar_pool();
                    if entry.op.is_read() && status == 0 {
                        let chunk = self.config.sar_chunk_size as usize;
                        let mut at = 0usize;
                        for &index in &chunks[..chunk_count] {
                            let len = chunk.min(entry.total - at);
                            // SAFETY: chunks are ours until released below.
                            copy_to_iov(
                                &entry.iov[..entry.iov_count],
                                at,
                                unsafe { pool.data_ptr(index) },
                                len,
                            );
                            at += len;
                        }
                    }
                    for &index in &chunks[..chunk_count] {
                        unsafe { pool.release(index) };
                    }
                    self.region.peer_data(entry.peer_id as usize).clear_sar();
                    None
                }
                StagedResource::Inject { index } => Some(StagedResource::Inject { index }),
                StagedResource::Mmap(stage) => Some(StagedResource::Mmap(stage)),
            };

            drop(tx);

            if let Some(resource) = after {
                self.finish_staged(&mut entry, resource, status);
            }

            let mut tx = self.tx.lock();
            tx.cq.post(entry.context, entry.op, entry.flags, status);
            drop(tx);
            retired += 1;
        }
        retired
    }

    /// Resource teardown that needs the peer's region, done outside the tx
    /// lock to keep the lock order region-then-tx.
    fn finish_staged(&self, entry: &mut PendingEntry, resource: StagedResource, status: i64) {
        match resource {
            StagedResource::Inject { index } => {
                let Some((_, _, peer_region)) = self.resolved(entry.peer_id) else {
                    warn!(peer = entry.peer_id, "peer vanished before teardown");
                    return;
                };
                if entry.op.is_read() && status == 0 {
                    // SAFETY: the buffer is ours until released below.
                    let src = unsafe { peer_region.inject_pool().data_ptr(index) };
                    copy_to_iov(&entry.iov[..entry.iov_count], 0, src, entry.total);
                }
                let guard = peer_region.lock();
                unsafe { peer_region.inject_pool().release(index) };
                drop(guard);
            }
            StagedResource::Mmap(mut stage) => {
                if entry.op.is_read() && status == 0 {
                    let len = entry.total;
                    copy_to_iov(&entry.iov[..entry.iov_count], 0, stage.as_mut_slice().as_ptr(), len);
                }
                drop(stage);
            }
            StagedResource::None | StagedResource::Sar { .. } => {}
        }
    }

    /// Return a resource taken during a failed admission. Sar chunks go back
    /// to our pool; an inject buffer is the caller's to release since it
    /// belongs to the peer region whose lock the caller still holds.
    fn release_resource(&self, resource: StagedResource) {
        match resource {
            StagedResource::None | StagedResource::Inject { .. } => {}
            StagedResource::Sar {
                chunks,
                chunk_count,
            } => {
                let pool = self.region.sar_pool();
                for &index in &chunks[..chunk_count] {
                    unsafe { pool.release(index) };
                }
            }
            StagedResource::Mmap(stage) => drop(stage),
        }
    }
}

// ============================================================================
// Byte-stream helpers
// ============================================================================

/// Copy `len` bytes starting at logical offset `at` of the fragmented stream
/// into `dst`.
fn copy_from_iov(iov: &[Iov], at: usize, dst: *mut u8, len: usize) {
    let mut skip = at;
    let mut copied = 0usize;
    for frag in iov {
        if copied == len {
            break;
        }
        if skip >= frag.len {
            skip -= frag.len;
            continue;
        }
        let take = (frag.len - skip).min(len - copied);
        // SAFETY: caller buffers stay valid for the duration of the call.
        unsafe {
            core::ptr::copy_nonoverlapping(frag.base.add(skip), dst.add(copied), take);
        }
        copied += take;
        skip = 0;
    }
    debug_assert_eq!(copied, len, "iov stream shorter than requested");
}

/// Copy `len` bytes from `src` into the fragmented stream starting at
/// logical offset `at`, scattering across fragments.
fn copy_to_iov(iov: &[Iov], at: usize, src: *const u8, len: usize) {
    let mut skip = at;
    let mut copied = 0usize;
    for frag in iov {
        if copied == len {
            break;
        }
        if skip >= frag.len {
            skip -= frag.len;
            continue;
        }
        let take = (frag.len - skip).min(len - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(src.add(copied), frag.base.add(skip), take);
        }
        copied += take;
        skip = 0;
    }
    debug_assert_eq!(copied, len, "iov stream shorter than requested");
}
