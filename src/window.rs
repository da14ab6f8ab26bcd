// Numan Thabit 2025
// window.rs - per-peer sliding window, ack handling and send selection

use tracing::debug;

use crate::{
    queue::NodeQueue,
    store::PacketStore,
    table::NodeTable,
    wire::{NodeId, Packet, PacketKind},
};

/// Sequence number given to the first packet sent to a fresh peer.
pub const INITIAL_SEQUENCE: u8 = 1;

// Keeps queued sequence numbers well inside the 8-bit space.
const MAX_QUEUED_PER_PEER: u8 = 127;

/// Send-side and receive-side sequence state for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerWindow {
    pub start: u8,
    pub current: u8,
    pub end: u8,
    pub pause_count: u8,
    pub paused: bool,
    /// Last sequence received in order from this peer.
    pub last_rx: u8,
}

impl PeerWindow {
    fn new(pause: u8) -> Self {
        Self {
            start: INITIAL_SEQUENCE,
            current: INITIAL_SEQUENCE,
            end: INITIAL_SEQUENCE,
            pause_count: pause,
            paused: false,
            last_rx: INITIAL_SEQUENCE.wrapping_sub(1),
        }
    }

    /// Sent and awaiting acknowledgement.
    pub fn in_flight(&self) -> u8 {
        self.current.wrapping_sub(self.start)
    }

    /// Everything not yet acknowledged.
    pub fn queued(&self) -> u8 {
        self.end.wrapping_sub(self.start)
    }

    pub fn unsent(&self) -> u8 {
        self.end.wrapping_sub(self.current)
    }
}

/// Sizing and policy knobs for a [`TxManager`].
#[derive(Debug, Clone, Copy)]
pub struct TxSettings {
    pub store_capacity: usize,
    pub window_size: u8,
    /// Stale acks tolerated before rewinding to the window start.
    pub retransmit_pause: u8,
    pub burst_size: u8,
    pub max_active: usize,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    peer: NodeId,
    idx: usize,
}

/// Reliable in-order sender for every peer of one endpoint.
#[derive(Debug)]
pub struct TxManager {
    settings: TxSettings,
    store: PacketStore,
    windows: NodeTable<PeerWindow>,
    active: NodeQueue,
    reservation: Option<Reservation>,
    last_serviced: Option<NodeId>,
    burst_used: u8,
    restarts: u64,
}

impl TxManager {
    pub fn new(settings: TxSettings) -> Self {
        assert!(settings.window_size > 0, "window size must be positive");
        assert!(settings.retransmit_pause > 0, "retransmit pause must be positive");
        Self {
            store: PacketStore::new(settings.store_capacity),
            windows: NodeTable::new(),
            active: NodeQueue::with_capacity(settings.max_active),
            reservation: None,
            last_serviced: None,
            burst_used: 0,
            restarts: 0,
            settings,
        }
    }

    /// Reserves a buffer for the next packet to `peer`.
    ///
    /// An earlier reservation that was never submitted is dropped.
    pub fn allocate_for_send(&mut self, peer: NodeId) -> Option<&mut Packet> {
        if let Some(stale) = self.reservation.take() {
            self.store.release(stale.idx);
        }
        if !self.active.contains(peer) && self.active.is_full() {
            return None;
        }
        let pause = self.settings.retransmit_pause;
        let window = self
            .windows
            .get_or_insert_with(peer, || PeerWindow::new(pause));
        if window.queued() >= MAX_QUEUED_PER_PEER {
            return None;
        }
        let seq = window.end;
        let idx = self.store.allocate(peer, seq)?;
        self.reservation = Some(Reservation { peer, idx });
        Some(self.store.packet_mut(idx))
    }

    /// Publishes the reserved packet into `peer`'s window.
    ///
    /// Panics when no reservation for `peer` is outstanding.
    pub fn submit(&mut self, peer: NodeId, kind: PacketKind, size: usize) {
        let reservation = match self.reservation.take() {
            Some(r) if r.peer == peer => r,
            other => panic!("submit to {peer} without a matching allocation ({other:?})"),
        };
        let Some(window) = self.windows.get_mut(peer) else {
            panic!("reserved packet for {peer} has no window");
        };
        let packet = self.store.packet_mut(reservation.idx);
        packet.set_kind(kind);
        packet.set_tx_seq(window.end);
        packet.set_data_size(size);
        self.store.publish(reservation.idx);
        window.end = window.end.wrapping_add(1);
        // Callers checked capacity at allocation time.
        self.active.insert(peer);
    }

    /// Drops an outstanding reservation without publishing it.
    pub fn cancel_reservation(&mut self) {
        if let Some(r) = self.reservation.take() {
            self.store.release(r.idx);
        }
    }

    /// Store index of the next packet to transmit to `peer`, advancing the window.
    pub fn next_to_send(&mut self, peer: NodeId) -> Option<usize> {
        let window = self.windows.get_mut(peer)?;
        if window.current == window.end {
            return None;
        }
        if window.in_flight() >= self.settings.window_size {
            if !window.paused {
                window.paused = true;
                window.pause_count = self.settings.retransmit_pause;
            }
            return None;
        }
        let seq = window.current;
        window.current = window.current.wrapping_add(1);
        match self.store.find(peer, seq) {
            Some(idx) => Some(idx),
            None => panic!("window of {peer} references missing seq {seq}"),
        }
    }

    /// Picks the next peer with sendable data, bursting on the last one serviced.
    pub fn next_packet(&mut self) -> Option<usize> {
        if let Some(last) = self.last_serviced {
            if self.burst_used < self.settings.burst_size {
                if let Some(idx) = self.next_to_send(last) {
                    self.burst_used += 1;
                    return Some(idx);
                }
            }
        }
        for step in 0..self.active.len() {
            let Some(peer) = self.active.after(self.last_serviced).nth(step) else {
                break;
            };
            if let Some(idx) = self.next_to_send(peer) {
                self.last_serviced = Some(peer);
                self.burst_used = 1;
                return Some(idx);
            }
        }
        None
    }

    /// Applies a cumulative ack from `peer`. Returns how many packets were released.
    pub fn on_ack(&mut self, peer: NodeId, ack: u8) -> usize {
        let Some(window) = self.windows.get_mut(peer) else {
            return 0;
        };
        let offset = ack.wrapping_sub(window.start);
        if offset < window.queued() {
            let released = offset + 1;
            for i in 0..released {
                self.store.free(peer, window.start.wrapping_add(i));
            }
            if window.in_flight() < released {
                window.current = ack.wrapping_add(1);
            }
            window.start = ack.wrapping_add(1);
            window.paused = false;
            window.pause_count = self.settings.retransmit_pause;
            if window.start == window.end {
                self.active.remove(peer);
            }
            return usize::from(released);
        }

        if window.in_flight() > 0 {
            window.pause_count = window.pause_count.saturating_sub(1);
            if window.pause_count == 0 {
                debug!(%peer, start = window.start, in_flight = window.in_flight(), "window restart");
                window.current = window.start;
                window.paused = false;
                window.pause_count = self.settings.retransmit_pause;
                self.restarts += 1;
            }
        }
        0
    }

    /// In-order gate for received data from `peer`.
    pub fn on_receive_sequence(&mut self, peer: NodeId, seq: u8) -> bool {
        let pause = self.settings.retransmit_pause;
        let window = self
            .windows
            .get_or_insert_with(peer, || PeerWindow::new(pause));
        if seq == window.last_rx.wrapping_add(1) {
            window.last_rx = seq;
            true
        } else {
            false
        }
    }

    /// Cumulative ack to advertise to `peer`.
    pub fn last_received(&self, peer: NodeId) -> u8 {
        self.windows
            .get(peer)
            .map_or(INITIAL_SEQUENCE.wrapping_sub(1), |w| w.last_rx)
    }

    /// Forgets `peer` entirely, releasing its buffers.
    pub fn remove_peer(&mut self, peer: NodeId) -> usize {
        if self.reservation.is_some_and(|r| r.peer == peer) {
            self.cancel_reservation();
        }
        let freed = self.store.free_peer(peer);
        self.windows.remove(peer);
        self.active.remove(peer);
        if self.last_serviced == Some(peer) {
            self.last_serviced = None;
            self.burst_used = 0;
        }
        freed
    }

    pub fn window(&self, peer: NodeId) -> Option<&PeerWindow> {
        self.windows.get(peer)
    }

    pub fn queued(&self, peer: NodeId) -> usize {
        self.windows.get(peer).map_or(0, |w| usize::from(w.queued()))
    }

    pub fn has_sendable(&self) -> bool {
        self.active.iter().any(|peer| {
            self.windows
                .get(peer)
                .is_some_and(|w| w.unsent() > 0 && w.in_flight() < self.settings.window_size)
        })
    }

    /// Peers with unacknowledged packets.
    pub fn active_peers(&self) -> &NodeQueue {
        &self.active
    }

    pub fn packet(&self, idx: usize) -> &Packet {
        self.store.packet(idx)
    }

    pub fn packet_mut(&mut self, idx: usize) -> &mut Packet {
        self.store.packet_mut(idx)
    }

    /// Peer a stored packet is addressed to.
    pub fn packet_peer(&self, idx: usize) -> NodeId {
        self.store.peer(idx)
    }

    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }
}
