// Numan Thabit 2025
// store.rs - fixed pool of outbound packet buffers keyed by (peer, sequence)

use crate::wire::{NodeId, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free,
    /// Handed to the application, sequence not yet published.
    Reserved,
    /// Part of a peer's window.
    Queued,
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntryState,
    peer: NodeId,
    seq: u8,
    packet: Packet,
}

/// Outbound packet pool. Lookups are linear scans over the pool.
#[derive(Debug)]
pub struct PacketStore {
    entries: Vec<Entry>,
    num_stored: u64,
    num_freed: u64,
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "packet store capacity must be positive");
        let entries = (0..capacity)
            .map(|_| Entry {
                state: EntryState::Free,
                peer: NodeId::MASTER,
                seq: 0,
                packet: Packet::zeroed(),
            })
            .collect();
        Self {
            entries,
            num_stored: 0,
            num_freed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Reserves the first free entry for `peer` under sequence `seq`.
    pub fn allocate(&mut self, peer: NodeId, seq: u8) -> Option<usize> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry.state == EntryState::Free)?;
        let entry = &mut self.entries[idx];
        entry.state = EntryState::Reserved;
        entry.peer = peer;
        entry.seq = seq;
        Some(idx)
    }

    /// Moves a reservation into the peer's window.
    pub fn publish(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        assert_eq!(
            entry.state,
            EntryState::Reserved,
            "publishing store entry {idx} that was never reserved"
        );
        entry.state = EntryState::Queued;
        self.num_stored += 1;
    }

    /// Drops a reservation that was never published.
    pub fn release(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        if entry.state == EntryState::Reserved {
            entry.state = EntryState::Free;
        }
    }

    pub fn find(&self, peer: NodeId, seq: u8) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.state == EntryState::Queued && entry.peer == peer && entry.seq == seq
        })
    }

    /// Frees the queued entry for `(peer, seq)`.
    ///
    /// Panics when the entry is missing: window bookkeeping guarantees it exists.
    pub fn free(&mut self, peer: NodeId, seq: u8) {
        let Some(idx) = self.find(peer, seq) else {
            panic!("packet store lost entry for {peer} seq {seq}");
        };
        self.entries[idx].state = EntryState::Free;
        self.num_freed += 1;
    }

    /// Frees every entry belonging to `peer`, reserved ones included.
    pub fn free_peer(&mut self, peer: NodeId) -> usize {
        let mut freed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.peer == peer) {
            match entry.state {
                EntryState::Queued => {
                    freed += 1;
                    self.num_freed += 1;
                }
                EntryState::Reserved | EntryState::Free => {}
            }
            entry.state = EntryState::Free;
        }
        freed
    }

    pub fn packet(&self, idx: usize) -> &Packet {
        &self.entries[idx].packet
    }

    pub fn packet_mut(&mut self, idx: usize) -> &mut Packet {
        &mut self.entries[idx].packet
    }

    pub fn peer(&self, idx: usize) -> NodeId {
        self.entries[idx].peer
    }

    pub fn in_use(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state != EntryState::Free)
            .count()
    }

    /// Packets published into a window since construction.
    pub fn num_stored(&self) -> u64 {
        self.num_stored
    }

    /// Published packets released again by ack or peer removal.
    pub fn num_freed(&self) -> u64 {
        self.num_freed
    }

    #[cfg(test)]
    pub(crate) fn queued_keys(&self) -> Vec<(NodeId, u8)> {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Queued)
            .map(|entry| (entry.peer, entry.seq))
            .collect()
    }
}
