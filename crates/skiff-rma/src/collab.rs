//! Seams to the rest of the stack.
//!
//! The engine drives data movement and command traffic; everything it needs
//! from outside comes through these traits so tests can substitute
//! deterministic fakes.

use std::io;

use crate::cmd::{MemKind, OpFlags, RmaOp};
use crate::config::RMA_IOV_LIMIT;

/// One local buffer fragment.
#[derive(Debug, Clone, Copy)]
pub struct Iov {
    pub base: *mut u8,
    pub len: usize,
}

impl Default for Iov {
    fn default() -> Self {
        Self {
            base: core::ptr::null_mut(),
            len: 0,
        }
    }
}

impl Iov {
    pub fn total(iov: &[Iov]) -> usize {
        iov.iter().map(|e| e.len).sum()
    }
}

/// Direction of a cross-process copy, from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    /// Local buffers -> remote process.
    ToPeer,
    /// Remote process -> local buffers.
    FromPeer,
}

// ============================================================================
// Cross-process copy
// ============================================================================

/// Direct copy between this process and a peer's address space.
pub trait CrossCopy: Send + Sync {
    /// Whether a direct copy to this peer can be attempted at all.
    fn available(&self, pid: u32) -> bool;

    /// Copy `total` bytes between `local` and the peer's `remote` addresses.
    /// Fragment counts are bounded by [`RMA_IOV_LIMIT`]; lengths on the two
    /// sides match in total but not fragment by fragment.
    fn copy(
        &self,
        pid: u32,
        local: &[Iov],
        remote: &[Iov],
        total: usize,
        dir: CopyDir,
    ) -> io::Result<()>;
}

/// [`CrossCopy`] over `process_vm_readv`/`process_vm_writev`.
pub struct ProcessVmCopy;

impl CrossCopy for ProcessVmCopy {
    fn available(&self, _pid: u32) -> bool {
        true
    }

    fn copy(
        &self,
        pid: u32,
        local: &[Iov],
        remote: &[Iov],
        total: usize,
        dir: CopyDir,
    ) -> io::Result<()> {
        debug_assert!(local.len() <= RMA_IOV_LIMIT && remote.len() <= RMA_IOV_LIMIT);

        let mut local_vec = [libc::iovec {
            iov_base: core::ptr::null_mut(),
            iov_len: 0,
        }; RMA_IOV_LIMIT];
        let mut remote_vec = local_vec;
        for (dst, src) in local_vec.iter_mut().zip(local) {
            dst.iov_base = src.base.cast();
            dst.iov_len = src.len;
        }
        for (dst, src) in remote_vec.iter_mut().zip(remote) {
            dst.iov_base = src.base.cast();
            dst.iov_len = src.len;
        }

        // The kernel may return a short count at a region boundary; loop
        // until the full total has moved.
        let mut done = 0usize;
        while done < total {
            let ret = unsafe {
                match dir {
                    CopyDir::ToPeer => libc::process_vm_writev(
                        pid as libc::pid_t,
                        local_vec.as_ptr(),
                        local.len() as libc::c_ulong,
                        remote_vec.as_ptr(),
                        remote.len() as libc::c_ulong,
                        0,
                    ),
                    CopyDir::FromPeer => libc::process_vm_readv(
                        pid as libc::pid_t,
                        local_vec.as_ptr(),
                        local.len() as libc::c_ulong,
                        remote_vec.as_ptr(),
                        remote.len() as libc::c_ulong,
                        0,
                    ),
                }
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "cross-process copy made no progress",
                ));
            }
            done += ret as usize;
            if done < total {
                advance(&mut local_vec, ret as usize);
                advance(&mut remote_vec, ret as usize);
            }
        }
        Ok(())
    }
}

fn advance(vec: &mut [libc::iovec], mut by: usize) {
    for entry in vec.iter_mut() {
        if by == 0 {
            break;
        }
        let eat = by.min(entry.iov_len);
        entry.iov_base = unsafe { entry.iov_base.cast::<u8>().add(eat).cast() };
        entry.iov_len -= eat;
        by -= eat;
    }
}

/// [`CrossCopy`] that is never available, forcing the staged strategies.
pub struct NoCrossCopy;

impl CrossCopy for NoCrossCopy {
    fn available(&self, _pid: u32) -> bool {
        false
    }

    fn copy(
        &self,
        _pid: u32,
        _local: &[Iov],
        _remote: &[Iov],
        _total: usize,
        _dir: CopyDir,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cross-process copy disabled",
        ))
    }
}

// ============================================================================
// Device IPC
// ============================================================================

/// Handle construction failed; the caller degrades to staged transfer.
#[derive(Debug)]
pub struct IpcExportError(pub io::Error);

impl std::fmt::Display for IpcExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device ipc handle export failed: {}", self.0)
    }
}

impl std::error::Error for IpcExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Exporting device-memory IPC handles for peer reopening.
pub trait DeviceIpc: Send + Sync {
    /// Whether this memory kind supports cross-process handles at all.
    fn ipc_enabled(&self, kind: MemKind) -> bool;

    /// Build an opaque handle for `base..base+len` on `device`, plus the
    /// offset of `base` within the exported mapping.
    fn export(
        &self,
        kind: MemKind,
        device: u64,
        base: *const u8,
        len: usize,
    ) -> Result<([u8; 64], u64), IpcExportError>;
}

/// [`DeviceIpc`] for builds without device runtimes.
pub struct NoDeviceIpc;

impl DeviceIpc for NoDeviceIpc {
    fn ipc_enabled(&self, _kind: MemKind) -> bool {
        false
    }

    fn export(
        &self,
        _kind: MemKind,
        _device: u64,
        _base: *const u8,
        _len: usize,
    ) -> Result<([u8; 64], u64), IpcExportError> {
        Err(IpcExportError(io::Error::new(
            io::ErrorKind::Unsupported,
            "no device runtime",
        )))
    }
}

// ============================================================================
// Completion delivery
// ============================================================================

/// Where finished operations are reported.
///
/// The engine checks fullness before staging anything and treats a full sink
/// as a retryable condition, so `post` after that check must not fail.
pub trait CompletionSink: Send {
    /// Whether the sink can accept one more entry right now.
    fn is_full(&self) -> bool;

    /// Report one finished operation. `err` is a negated errno, 0 on success.
    fn post(&mut self, context: usize, op: RmaOp, flags: OpFlags, err: i64);

    /// Account an operation that completes without a full entry (inject
    /// writes suppress the entry but still count).
    fn count_tx(&mut self, _op: RmaOp) {}
}

// ============================================================================
// Peer wakeup
// ============================================================================

/// Kick a peer after commands were committed to its ring.
pub trait PeerSignal: Send + Sync {
    fn signal(&self, peer_id: i32);
}

/// [`PeerSignal`] for pure-polling deployments.
pub struct NoSignal;

impl PeerSignal for NoSignal {
    fn signal(&self, _peer_id: i32) {}
}
