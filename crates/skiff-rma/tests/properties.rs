//! End-to-end exercises over a pair of in-process regions.
//!
//! The initiating endpoint runs the real transmit path; the harness plays
//! the target by consuming committed command slots, moving the data the way
//! a peer's progress loop would, returning credit, and answering deferred
//! operations through their reserved response slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use skiff_rma::cmd::{Payload, PayloadKind, Resp};
use skiff_rma::{
    CompletionSink, Disposition, Iov, MemDesc, MemKind, NoCrossCopy, NoDeviceIpc, NoSignal,
    OpFlags, ProcessVmCopy, RmaConfig, RmaEndpoint, RmaError, RmaMsg, RmaOp, RmaRegion,
};

const PEER: i32 = 1;
const REMOTE_ID: i32 = 5;

#[derive(Debug, Clone)]
struct Event {
    context: usize,
    op: RmaOp,
    flags: OpFlags,
    err: i64,
}

#[derive(Clone, Default)]
struct RecordingCq {
    events: Arc<Mutex<Vec<Event>>>,
    counted: Arc<Mutex<Vec<RmaOp>>>,
    full: Arc<AtomicBool>,
}

impl CompletionSink for RecordingCq {
    fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    fn post(&mut self, context: usize, op: RmaOp, flags: OpFlags, err: i64) {
        self.events.lock().unwrap().push(Event {
            context,
            op,
            flags,
            err,
        });
    }

    fn count_tx(&mut self, op: RmaOp) {
        self.counted.lock().unwrap().push(op);
    }
}

struct Pair {
    ep: RmaEndpoint,
    own: Arc<RmaRegion>,
    peer: Arc<RmaRegion>,
    cq: RecordingCq,
}

fn test_config() -> RmaConfig {
    RmaConfig {
        ring_capacity: 8,
        inject_size: 1024,
        inject_count: 4,
        sar_threshold: 8192,
        sar_chunk_size: 2048,
        sar_count: 8,
        pending_count: 8,
        max_peers: 8,
        ..RmaConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn pair_with(config: &RmaConfig, cma: bool) -> Pair {
    init_tracing();
    let own = Arc::new(RmaRegion::create_anon(config).unwrap());
    let peer = Arc::new(RmaRegion::create_anon(config).unwrap());
    let cq = RecordingCq::default();
    let copy: Box<dyn skiff_rma::CrossCopy> = if cma {
        Box::new(ProcessVmCopy)
    } else {
        Box::new(NoCrossCopy)
    };
    let ep = RmaEndpoint::new(
        config.clone(),
        Arc::clone(&own),
        Box::new(cq.clone()),
        copy,
        Box::new(NoDeviceIpc),
        Box::new(NoSignal),
    )
    .unwrap();
    ep.add_peer(PEER, REMOTE_ID, Arc::clone(&peer));
    Pair { ep, own, peer, cq }
}

fn pair(cma: bool) -> Pair {
    pair_with(&test_config(), cma)
}

/// What the target observed for one operation.
#[derive(Debug)]
struct Serviced {
    op: RmaOp,
    kind: PayloadKind,
    flags: OpFlags,
    size: u64,
    cq_data: u64,
    peer_id: i32,
    slots: usize,
}

fn scatter_to_rma(rma: &[skiff_rma::RmaIov], src: &[u8]) {
    let mut at = 0usize;
    for entry in rma {
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(at),
                entry.addr as *mut u8,
                entry.len as usize,
            );
        }
        at += entry.len as usize;
    }
}

fn gather_from_rma(rma: &[skiff_rma::RmaIov], dst: &mut [u8]) {
    let mut at = 0usize;
    for entry in rma {
        unsafe {
            core::ptr::copy_nonoverlapping(
                entry.addr as *const u8,
                dst.as_mut_ptr().add(at),
                entry.len as usize,
            );
        }
        at += entry.len as usize;
    }
}

fn answer(own: &RmaRegion, resp_offset: u64, status: i64) {
    assert_ne!(resp_offset, 0, "deferred command carries no response slot");
    // SAFETY: the offset was produced by the initiator for its own region.
    let resp = unsafe { &mut *own.region().offset(resp_offset as usize).cast::<Resp>() };
    resp.status = status;
}

/// Drain and service every committed command in the peer's ring, acting as
/// the target's progress loop. Returns one record per operation.
fn service_peer(pair: &Pair) -> Vec<Serviced> {
    let own = &pair.own;
    let peer = &pair.peer;
    let mut out = Vec::new();

    let guard = peer.lock();
    loop {
        let ring = peer.cmd_ring();
        let Some(cmd) = (unsafe { ring.next_rx() }) else {
            break;
        };

        let op = cmd.header.op().unwrap();
        let flags = cmd.header.flags();
        let size = cmd.header.size;
        let cq_data = cmd.header.cq_data;
        let peer_id = cmd.header.peer_id;
        let resp_offset = cmd.header.resp_offset;
        let payload = cmd.decode().unwrap();
        let mut slots = 1;

        match payload {
            Payload::None => {}
            Payload::RmaList(_) => {
                // Ack-only command from the fast path; data already moved.
            }
            Payload::Inline(desc) => {
                let rma = desc.rma;
                assert_eq!(op, RmaOp::Write);
                scatter_to_rma(rma.as_slice(), &desc.data[..size as usize]);
            }
            Payload::Inject(desc) => {
                let rma = desc.rma;
                let index = peer.inject_pool().index_of_offset(desc.buf_offset as usize);
                let buf = unsafe { peer.inject_pool().data_ptr(index) };
                match op {
                    RmaOp::Write => {
                        let data =
                            unsafe { core::slice::from_raw_parts(buf, size as usize) };
                        scatter_to_rma(rma.as_slice(), data);
                        unsafe { peer.inject_pool().release(index) };
                    }
                    RmaOp::ReadReq => {
                        let data = unsafe {
                            core::slice::from_raw_parts_mut(buf, size as usize)
                        };
                        gather_from_rma(rma.as_slice(), data);
                        answer(own, resp_offset, 0);
                        // The initiator owns the buffer until it drains the
                        // response.
                    }
                    other => panic!("unexpected inject op {other:?}"),
                }
            }
            Payload::Iov(desc) => {
                let desc = *desc;
                let rma = next_rma_list(peer, &mut slots);
                assert_eq!(desc.pid, std::process::id() as u64);
                let mut flat = vec![0u8; size as usize];
                match op {
                    RmaOp::Write => {
                        let mut at = 0usize;
                        for frag in &desc.iov[..desc.count as usize] {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    frag.base as *const u8,
                                    flat.as_mut_ptr().add(at),
                                    frag.len as usize,
                                );
                            }
                            at += frag.len as usize;
                        }
                        scatter_to_rma(&rma, &flat);
                    }
                    RmaOp::ReadReq => {
                        gather_from_rma(&rma, &mut flat);
                        let mut at = 0usize;
                        for frag in &desc.iov[..desc.count as usize] {
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    flat.as_ptr().add(at),
                                    frag.base as *mut u8,
                                    frag.len as usize,
                                );
                            }
                            at += frag.len as usize;
                        }
                    }
                    other => panic!("unexpected iov op {other:?}"),
                }
                answer(own, resp_offset, 0);
            }
            Payload::Sar(desc) => {
                let desc = *desc;
                let rma = next_rma_list(peer, &mut slots);
                let chunk = own.sar_pool().slot_size() as usize;
                let mut flat = vec![0u8; size as usize];
                match op {
                    RmaOp::Write => {
                        let mut at = 0usize;
                        for &offset in &desc.bufs[..desc.count as usize] {
                            let len = chunk.min(size as usize - at);
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    own.region().offset(offset as usize),
                                    flat.as_mut_ptr().add(at),
                                    len,
                                );
                            }
                            at += len;
                        }
                        scatter_to_rma(&rma, &flat);
                    }
                    RmaOp::ReadReq => {
                        gather_from_rma(&rma, &mut flat);
                        let mut at = 0usize;
                        for &offset in &desc.bufs[..desc.count as usize] {
                            let len = chunk.min(size as usize - at);
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    flat.as_ptr().add(at),
                                    own.region().offset(offset as usize),
                                    len,
                                );
                            }
                            at += len;
                        }
                    }
                    other => panic!("unexpected sar op {other:?}"),
                }
                answer(own, resp_offset, 0);
            }
            Payload::Ipc(_) => panic!("device ipc is never exported in these runs"),
            Payload::Mmap(desc) => {
                let desc = *desc;
                let rma = next_rma_list(peer, &mut slots);
                let end = desc.name.iter().position(|&b| b == 0).unwrap();
                let cname = std::ffi::CString::new(&desc.name[..end]).unwrap();
                let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
                assert!(fd >= 0, "target cannot open staged mapping");
                let ptr = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        desc.len as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        fd,
                        0,
                    )
                };
                unsafe { libc::close(fd) };
                assert_ne!(ptr, libc::MAP_FAILED);
                let staged = unsafe {
                    core::slice::from_raw_parts_mut(ptr.cast::<u8>(), desc.len as usize)
                };
                match op {
                    RmaOp::Write => scatter_to_rma(&rma, staged),
                    RmaOp::ReadReq => gather_from_rma(&rma, staged),
                    other => panic!("unexpected mmap op {other:?}"),
                }
                unsafe { libc::munmap(ptr, desc.len as usize) };
                answer(own, resp_offset, 0);
            }
        }

        let kind = PayloadKind::from_raw(cmd.header.payload_kind).unwrap();
        unsafe { ring.discard_rx() };
        peer.return_credit(1);

        out.push(Serviced {
            op,
            kind,
            flags,
            size,
            cq_data,
            peer_id,
            slots,
        });
    }
    drop(guard);
    out
}

/// Consume the continuation slot of a two-slot command.
fn next_rma_list(peer: &RmaRegion, slots: &mut usize) -> Vec<skiff_rma::RmaIov> {
    let ring = peer.cmd_ring();
    // The first slot is still the ring head; its continuation follows.
    unsafe { ring.discard_rx() };
    peer.return_credit(1);
    *slots += 1;
    let cmd = unsafe { ring.next_rx() }.expect("continuation slot missing");
    match cmd.decode().unwrap() {
        Payload::RmaList(block) => block.as_slice().to_vec(),
        other => panic!("expected target list, got {other:?}"),
    }
}

// ============================================================================
// Strategy selection and round trips
// ============================================================================

#[test]
fn inline_write_round_trip() {
    let pair = pair(false);
    let src = [0xabu8; 64];
    let mut dst = [0u8; 64];

    let disp = pair
        .ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 100)
        .unwrap();
    assert_eq!(disp, Disposition::Sync);

    let seen = service_peer(&pair);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, PayloadKind::Inline);
    assert_eq!(seen[0].op, RmaOp::Write);
    assert_eq!(seen[0].size, 64);
    assert_eq!(seen[0].peer_id, REMOTE_ID);
    assert_eq!(seen[0].slots, 1);
    assert_eq!(dst, src);

    let events = pair.cq.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context, 100);
    assert_eq!(events[0].err, 0);
    assert_eq!(pair.peer.cmd_credit(), 8);
}

#[test]
fn inject_write_uses_pool_buffer() {
    let pair = pair(false);
    let src: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
    let mut dst = vec![0u8; 512];

    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 101)
        .unwrap();
    // The staged buffer is held until the target consumes the command.
    assert_eq!(pair.peer.inject_pool().free_count(), 3);

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Inject);
    assert_eq!(seen[0].slots, 1);
    assert_eq!(dst, src);
    assert_eq!(pair.peer.inject_pool().free_count(), 4);
    assert_eq!(pair.cq.events.lock().unwrap().len(), 1);
}

#[test]
fn inject_read_defers_until_response() {
    let pair = pair(false);
    let src: Vec<u8> = (0..600u32).map(|i| (i * 3) as u8).collect();
    let mut dst = vec![0u8; 600];

    let disp = pair
        .ep
        .read(&mut dst, PEER, src.as_ptr() as u64, 7, 102)
        .unwrap();
    assert_eq!(disp, Disposition::Deferred);
    assert!(pair.cq.events.lock().unwrap().is_empty());

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Inject);
    assert_eq!(seen[0].op, RmaOp::ReadReq);
    assert!(seen[0].flags.contains(OpFlags::RMA_RESP));
    // Data sits in the staged buffer until the response is drained.
    assert_eq!(dst, vec![0u8; 600]);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(dst, src);
    assert_eq!(pair.peer.inject_pool().free_count(), 4);

    let events = pair.cq.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context, 102);
    assert_eq!(events[0].op, RmaOp::ReadReq);
}

#[test]
fn fast_path_moves_data_synchronously() {
    let pair = pair(true);
    let src = vec![0x5au8; 5000];
    let mut dst = vec![0u8; 5000];

    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 103)
        .unwrap();
    // Data lands before the target runs at all.
    assert_eq!(dst, src);
    {
        let events = pair.cq.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        // The completion names the caller's write, not the wire ack.
        assert_eq!(events[0].op, RmaOp::Write);
    }

    let seen = service_peer(&pair);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].op, RmaOp::WriteAck);
    assert_eq!(seen[0].kind, PayloadKind::RmaList);
    assert_eq!(seen[0].slots, 1);
}

#[test]
fn fast_path_read() {
    let pair = pair(true);
    let src = vec![0xc3u8; 300];
    let mut dst = vec![0u8; 300];

    pair.ep
        .read(&mut dst, PEER, src.as_ptr() as u64, 7, 104)
        .unwrap();
    assert_eq!(dst, src);
    assert_eq!(pair.cq.events.lock().unwrap()[0].op, RmaOp::ReadReq);

    let seen = service_peer(&pair);
    assert_eq!(seen[0].op, RmaOp::ReadAck);
}

#[test]
fn delivery_complete_forces_target_driven_copy() {
    let pair = pair(true);
    let src = vec![9u8; 2000];
    let mut dst = vec![0u8; 2000];
    let iov = [Iov {
        base: src.as_ptr() as *mut u8,
        len: src.len(),
    }];
    let rma = [skiff_rma::RmaIov {
        addr: dst.as_mut_ptr() as u64,
        len: 2000,
        key: 7,
    }];
    let msg = RmaMsg {
        iov: &iov,
        rma: &rma,
        addr: PEER,
        context: 105,
        cq_data: 0,
        mem: MemDesc::default(),
    };

    pair.ep
        .writemsg(&msg, OpFlags::DELIVERY_COMPLETE)
        .unwrap();
    // Nothing moved and nothing completed until the target acts.
    assert_eq!(dst, vec![0u8; 2000]);
    assert!(pair.cq.events.lock().unwrap().is_empty());

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Iov);
    assert_eq!(seen[0].slots, 2);
    assert_eq!(dst, src);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(pair.cq.events.lock().unwrap().len(), 1);
    assert_eq!(pair.peer.cmd_credit(), 8);
}

#[test]
fn sar_write_without_cma() {
    let pair = pair(false);
    let src: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut dst = vec![0u8; 4096];

    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 106)
        .unwrap();
    // Two staging chunks held, peer pair gated.
    assert_eq!(pair.own.sar_pool().free_count(), 6);
    assert!(pair.own.peer_data(PEER as usize).sar_active());

    // The gate turns away everything toward that peer.
    let small = [1u8; 8];
    assert!(matches!(
        pair.ep.write(&small, PEER, dst.as_mut_ptr() as u64, 7, 107),
        Err(RmaError::Again)
    ));

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Sar);
    assert_eq!(seen[0].slots, 2);
    assert_eq!(dst, src);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(pair.own.sar_pool().free_count(), 8);
    assert!(!pair.own.peer_data(PEER as usize).sar_active());
    assert_eq!(pair.cq.events.lock().unwrap().len(), 1);
}

#[test]
fn sar_read_without_cma() {
    let pair = pair(false);
    let src: Vec<u8> = (0..3000u32).map(|i| (i % 127) as u8).collect();
    let mut dst = vec![0u8; 3000];

    pair.ep
        .read(&mut dst, PEER, src.as_ptr() as u64, 7, 108)
        .unwrap();

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Sar);
    assert_eq!(seen[0].op, RmaOp::ReadReq);
    assert_eq!(dst, vec![0u8; 3000]);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(dst, src);
    assert_eq!(pair.own.sar_pool().free_count(), 8);
}

#[test]
fn mmap_above_sar_threshold() {
    let pair = pair(false);
    let src: Vec<u8> = (0..16384u32).map(|i| (i % 241) as u8).collect();
    let mut dst = vec![0u8; 16384];

    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 109)
        .unwrap();

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Mmap);
    assert_eq!(seen[0].slots, 2);
    assert_eq!(dst, src);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(pair.cq.events.lock().unwrap().len(), 1);
}

#[test]
fn readv_collapses_targets() {
    let pair = pair(false);
    let src: Vec<u8> = (0..96u32).map(|i| i as u8).collect();
    let mut a = [0u8; 32];
    let mut b = [0u8; 64];
    let iov = [
        Iov {
            base: a.as_mut_ptr(),
            len: a.len(),
        },
        Iov {
            base: b.as_mut_ptr(),
            len: b.len(),
        },
    ];

    pair.ep
        .readv(&iov, PEER, src.as_ptr() as u64, 7, 110)
        .unwrap();
    let seen = service_peer(&pair);
    assert_eq!(seen[0].size, 96);

    pair.ep.drain_responses();
    assert_eq!(&a[..], &src[..32]);
    assert_eq!(&b[..], &src[32..]);
}

#[test]
fn boundary_lengths_pick_their_strategy_and_round_trip() {
    let config = test_config();
    let inline = config.inline_size as usize;
    let inject = config.inject_size as usize;
    let cases = [
        (0usize, PayloadKind::Inline),
        (inline, PayloadKind::Inline),
        (inline + 1, PayloadKind::Inject),
        (inject, PayloadKind::Inject),
        (inject + 1, PayloadKind::Sar),
        (config.sar_threshold + 1, PayloadKind::Mmap),
    ];

    for (len, kind) in cases {
        let pair = pair(false);
        let src: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
        let mut dst = vec![0u8; len];

        pair.ep
            .write(&src, PEER, dst.as_mut_ptr() as u64, 7, len)
            .unwrap();
        let seen = service_peer(&pair);
        assert_eq!(seen[0].kind, kind, "len {len}");
        assert_eq!(seen[0].size as usize, len, "len {len}");
        assert_eq!(dst, src, "len {len}");

        pair.ep.drain_responses();
        assert_eq!(pair.peer.cmd_credit(), 8, "len {len}");
        assert_eq!(pair.cq.events.lock().unwrap().len(), 1, "len {len}");
    }
}

#[test]
fn fast_path_delivers_the_same_bytes_as_staging() {
    let len = 600usize;
    let src: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();

    let fast = pair(true);
    let mut fast_dst = vec![0u8; len];
    fast.ep
        .write(&src, PEER, fast_dst.as_mut_ptr() as u64, 7, 700)
        .unwrap();
    service_peer(&fast);

    let staged = pair(false);
    let mut staged_dst = vec![0u8; len];
    staged
        .ep
        .write(&src, PEER, staged_dst.as_mut_ptr() as u64, 7, 701)
        .unwrap();
    service_peer(&staged);
    staged.ep.drain_responses();

    assert_eq!(fast_dst, src);
    assert_eq!(fast_dst, staged_dst);
    assert_eq!(fast.cq.events.lock().unwrap().len(), 1);
    assert_eq!(staged.cq.events.lock().unwrap().len(), 1);
}

#[test]
fn device_payload_above_window_stays_in_staging_pool() {
    let pair = pair(false);
    let src = vec![0u8; 10000];
    let mut dst = vec![0u8; 10000];
    let iov = [Iov {
        base: src.as_ptr() as *mut u8,
        len: src.len(),
    }];
    let rma = [skiff_rma::RmaIov {
        addr: dst.as_mut_ptr() as u64,
        len: 10000,
        key: 7,
    }];
    let msg = RmaMsg {
        iov: &iov,
        rma: &rma,
        addr: PEER,
        context: 800,
        cq_data: 0,
        mem: MemDesc {
            kind: MemKind::Cuda,
            device: 0,
            device_only: false,
        },
    };

    // Larger than one chunk window, but the named mapping would need a host
    // copy of a device buffer; the transfer must segment instead.
    let disp = pair.ep.writemsg(&msg, OpFlags::empty()).unwrap();
    assert_eq!(disp, Disposition::Deferred);
    assert_eq!(pair.own.sar_pool().free_count(), 4);
    assert!(pair.own.peer_data(PEER as usize).sar_active());

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Sar);
    assert_eq!(seen[0].slots, 2);

    assert_eq!(pair.ep.drain_responses(), 1);
    assert_eq!(pair.own.sar_pool().free_count(), 8);
    assert!(!pair.own.peer_data(PEER as usize).sar_active());
}

// ============================================================================
// Remote completion data
// ============================================================================

#[test]
fn writedata_carries_remote_cq_data() {
    let pair = pair(true);
    let src = [3u8; 16];
    let mut dst = [0u8; 16];

    pair.ep
        .writedata(&src, 0xfeed_f00d, PEER, dst.as_mut_ptr() as u64, 7, 111)
        .unwrap();

    let seen = service_peer(&pair);
    // Remote completion data disqualifies the fast path.
    assert_ne!(seen[0].kind, PayloadKind::RmaList);
    assert!(seen[0].flags.contains(OpFlags::REMOTE_CQ_DATA));
    assert_eq!(seen[0].cq_data, 0xfeed_f00d);
    assert_eq!(dst, src);
}

#[test]
fn inject_skips_completion_entry() {
    let pair = pair(false);
    let src = [0x11u8; 200];
    let mut dst = [0u8; 200];

    pair.ep
        .inject(&src, PEER, dst.as_mut_ptr() as u64, 7)
        .unwrap();

    assert!(pair.cq.events.lock().unwrap().is_empty());
    assert_eq!(*pair.cq.counted.lock().unwrap(), vec![RmaOp::Write]);

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Inline);
    assert_eq!(dst, src);
}

#[test]
fn inject_writedata_sets_flag() {
    let pair = pair(false);
    let src = [0x22u8; 400];
    let mut dst = [0u8; 400];

    pair.ep
        .inject_writedata(&src, 42, PEER, dst.as_mut_ptr() as u64, 7)
        .unwrap();

    let seen = service_peer(&pair);
    assert_eq!(seen[0].kind, PayloadKind::Inject);
    assert!(seen[0].flags.contains(OpFlags::REMOTE_CQ_DATA));
    assert_eq!(seen[0].cq_data, 42);
    assert_eq!(dst, src);
}

// ============================================================================
// Backpressure and unwinding
// ============================================================================

#[test]
fn unresolved_peer_is_retryable() {
    let pair = pair(false);
    let src = [0u8; 8];
    let err = pair.ep.write(&src, 3, 0x1000, 7, 112).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn credit_exhaustion_is_retryable_and_clean() {
    let pair = pair(false);
    let src = [7u8; 16];
    let mut dst = [0u8; 16];

    for i in 0..8 {
        pair.ep
            .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 200 + i)
            .unwrap();
    }
    assert_eq!(pair.peer.cmd_credit(), 0);
    assert!(matches!(
        pair.ep.write(&src, PEER, dst.as_mut_ptr() as u64, 7, 299),
        Err(RmaError::Again)
    ));
    // Eight completions, none for the rejected attempt.
    assert_eq!(pair.cq.events.lock().unwrap().len(), 8);

    let seen = service_peer(&pair);
    assert_eq!(seen.len(), 8);
    assert_eq!(pair.peer.cmd_credit(), 8);

    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 300)
        .unwrap();
    assert_eq!(pair.cq.events.lock().unwrap().len(), 9);
}

#[test]
fn returned_credit_without_space_cannot_split_a_command() {
    let pair = pair(false);
    let src = [4u8; 16];
    let mut dst = [0u8; 16];

    for i in 0..7 {
        pair.ep
            .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 900 + i)
            .unwrap();
    }
    assert_eq!(pair.peer.cmd_ring().len(), 7);

    // A misbehaving owner hands back credit for a slot it never consumed.
    pair.peer.return_credit(1);
    assert_eq!(pair.peer.cmd_credit(), 2);

    // A two-slot command passes the credit gate but only one slot exists;
    // nothing of it may reach the ring.
    let iov = [Iov {
        base: src.as_ptr() as *mut u8,
        len: src.len(),
    }];
    let rma = [skiff_rma::RmaIov {
        addr: dst.as_mut_ptr() as u64,
        len: 16,
        key: 7,
    }];
    let msg = RmaMsg {
        iov: &iov,
        rma: &rma,
        addr: PEER,
        context: 999,
        cq_data: 0,
        mem: MemDesc::default(),
    };
    assert!(matches!(
        pair.ep.writemsg(&msg, OpFlags::DELIVERY_COMPLETE),
        Err(RmaError::Again)
    ));
    assert_eq!(pair.peer.cmd_ring().len(), 7);
    assert_eq!(pair.own.sar_pool().free_count(), 8);

    let seen = service_peer(&pair);
    assert_eq!(seen.len(), 7);
    assert!(seen.iter().all(|s| s.slots == 1));
}

#[test]
fn full_completion_sink_is_retryable() {
    let pair = pair(false);
    let src = [7u8; 16];
    let mut dst = [0u8; 16];

    pair.cq.full.store(true, Ordering::Relaxed);
    assert!(matches!(
        pair.ep.write(&src, PEER, dst.as_mut_ptr() as u64, 7, 113),
        Err(RmaError::Again)
    ));
    assert_eq!(pair.peer.cmd_credit(), 8);

    pair.cq.full.store(false, Ordering::Relaxed);
    pair.ep
        .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 114)
        .unwrap();
}

#[test]
fn inject_pool_exhaustion_unwinds() {
    let pair = pair(false);
    let src = vec![1u8; 512];
    let mut dst = vec![0u8; 512];

    for i in 0..4 {
        pair.ep
            .write(&src, PEER, dst.as_mut_ptr() as u64, 7, 400 + i)
            .unwrap();
    }
    assert_eq!(pair.peer.inject_pool().free_count(), 0);

    let credit_before = pair.peer.cmd_credit();
    assert!(matches!(
        pair.ep.write(&src, PEER, dst.as_mut_ptr() as u64, 7, 499),
        Err(RmaError::Again)
    ));
    assert_eq!(pair.peer.cmd_credit(), credit_before);
    assert_eq!(pair.cq.events.lock().unwrap().len(), 4);
}

#[test]
fn pending_exhaustion_releases_staged_buffer() {
    let config = RmaConfig {
        pending_count: 1,
        ..test_config()
    };
    let pair = pair_with(&config, false);
    let src = vec![2u8; 512];
    let mut one = vec![0u8; 512];
    let mut two = vec![0u8; 512];

    pair.ep
        .read(&mut one, PEER, src.as_ptr() as u64, 7, 500)
        .unwrap();
    let free_before = pair.peer.inject_pool().free_count();
    let credit_before = pair.peer.cmd_credit();

    assert!(matches!(
        pair.ep.read(&mut two, PEER, src.as_ptr() as u64, 7, 501),
        Err(RmaError::Again)
    ));
    // The rejected read gave back its staged buffer and took no credit.
    assert_eq!(pair.peer.inject_pool().free_count(), free_before);
    assert_eq!(pair.peer.cmd_credit(), credit_before);

    service_peer(&pair);
    pair.ep.drain_responses();
    assert_eq!(one, src);
}

#[test]
fn sar_pool_exhaustion_unwinds() {
    let config = RmaConfig {
        sar_count: 1,
        sar_chunk_size: 2048,
        ..test_config()
    };
    let pair = pair_with(&config, false);
    let src = vec![3u8; 4096];
    let mut dst = vec![0u8; 4096];

    // Needs two chunks, pool has one: nothing may stick.
    assert!(matches!(
        pair.ep.write(&src, PEER, dst.as_mut_ptr() as u64, 7, 600),
        Err(RmaError::Again)
    ));
    assert_eq!(pair.own.sar_pool().free_count(), 1);
    assert!(!pair.own.peer_data(PEER as usize).sar_active());
    assert_eq!(pair.peer.cmd_credit(), 8);
    assert!(pair.cq.events.lock().unwrap().is_empty());
}
