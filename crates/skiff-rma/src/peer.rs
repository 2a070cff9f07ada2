//! Peer addressing.
//!
//! A peer id is an index into the endpoint's table. Resolution is
//! asynchronous: inserting an address starts it, and an entry becomes usable
//! once the attached region and the exchanged reverse id are in place.
//! Operations against an unresolved peer report retryable busy, never an
//! error.

use std::sync::Arc;

use crate::layout::RmaRegion;

/// A fully resolved peer: its region attached, its side's id for us known.
pub struct Peer {
    /// Our index for this peer.
    pub id: i32,
    /// Pid of the process owning `region`, the target of direct copies.
    pub pid: u32,
    /// Our id in the peer's own table, stamped into command headers so the
    /// peer can attribute traffic.
    pub remote_id: i32,
    /// The peer's region. Commands to this peer land in its command ring.
    pub region: Arc<RmaRegion>,
}

/// Fixed-capacity peer table.
pub struct PeerTable {
    slots: Vec<Option<Peer>>,
}

impl PeerTable {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Complete resolution of peer `id`.
    pub fn insert(&mut self, id: i32, remote_id: i32, region: Arc<RmaRegion>) {
        assert!(id >= 0 && (id as usize) < self.slots.len(), "peer id out of range");
        let pid = region.owner_pid();
        self.slots[id as usize] = Some(Peer {
            id,
            pid,
            remote_id,
            region,
        });
    }

    pub fn remove(&mut self, id: i32) -> Option<Peer> {
        self.slots.get_mut(id as usize).and_then(Option::take)
    }

    /// Look up a peer; `None` means resolution has not completed.
    pub fn resolve(&self, id: i32) -> Option<&Peer> {
        if id < 0 {
            return None;
        }
        self.slots.get(id as usize).and_then(Option::as_ref)
    }
}
