// Numan Thabit 2025
// master.rs - master side of the slot pipeline
use tracing::{debug, trace};

use crate::{
    api::{BusEndpoint, SlotBuffers, SlotEngine, TxError},
    config::{ChannelMode, Config},
    metrics::LinkStats,
    network::{join_requests, write_join_response, MembershipSettings, NetworkManager, NodeBitmap},
    ring::RingBuffer,
    rx::RxManager,
    sched::Scheduler,
    window::{TxManager, TxSettings},
    wire::{
        Addr, Header, MasterHeader, NodeHeader, NodeId, Packet, PacketKind, Role, WireError,
        MAX_LOOKAHEAD,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outgoing {
    Store(usize),
    Scratch(usize),
    Response,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    handle: Outgoing,
    kind: PacketKind,
    dst: Addr,
}

/// Receive buffer kept back from the bus until post-processing.
#[derive(Debug, Clone, Copy)]
enum Held {
    Data { idx: usize, src: NodeId },
    Joins { idx: usize },
}

/// Bus master: owns the schedule, membership and one send window per node.
#[derive(Debug)]
pub struct MasterEngine {
    mode: ChannelMode,
    lookahead: usize,
    reset_cycles: u64,
    response_interval: u64,
    tx: TxManager,
    rx: RxManager,
    network: NetworkManager,
    scheduler: Scheduler,
    upcoming: RingBuffer<Addr>,
    planned: Vec<Addr>,
    evicted: Vec<NodeId>,
    /// Owner of the slot currently on the bus.
    owner: Addr,
    rx_idx: usize,
    rx_header: Option<NodeHeader>,
    held: Option<Held>,
    prepared: Option<Frame>,
    sending: Option<Frame>,
    // Two buffers so an empty packet is never rewritten while the previous one is in flight.
    scratch: [Packet; 2],
    response: Packet,
    cycle: u64,
    stats: LinkStats,
}

impl MasterEngine {
    pub fn new(config: &Config) -> Self {
        let mode = config.bus.channel_mode;
        let master = &config.master;
        let tx = TxManager::new(TxSettings {
            store_capacity: master.tx_packets,
            window_size: config.bus.window_size,
            retransmit_pause: config.bus.retransmit_pause,
            burst_size: master.burst_size,
            max_active: master.max_active_tx,
        });
        let mut rx = RxManager::new(master.rx_packets);
        let Some(rx_idx) = rx.find_free() else {
            unreachable!("fresh rx pool has free buffers");
        };
        let network = NetworkManager::new(MembershipSettings {
            max_nodes: master.max_nodes,
            max_pending: master.max_pending_joins,
            node_ttl: master.node_ttl_ticks,
            provisional_ttl: master.provisional_ttl_ticks,
            retire_ticks: master.retire_ticks,
            tick: config.bus.ttl_tick(),
        });

        let mut upcoming = RingBuffer::with_capacity(2 * (MAX_LOOKAHEAD + 1) + 1);
        if mode == ChannelMode::Single {
            let _ = upcoming.push(Addr::MASTER);
        }

        let mut engine = Self {
            mode,
            lookahead: config.bus.lookahead.clamp(1, MAX_LOOKAHEAD),
            reset_cycles: u64::from(master.reset_cycles),
            response_interval: u64::from(master.join_response_interval.max(2)),
            tx,
            rx,
            network,
            scheduler: Scheduler::new(&config.scheduler, mode),
            upcoming,
            planned: Vec::with_capacity(MAX_LOOKAHEAD + 1),
            evicted: Vec::new(),
            owner: Addr::Invalid,
            rx_idx,
            rx_header: None,
            held: None,
            prepared: None,
            sending: None,
            scratch: [Packet::zeroed(), Packet::zeroed()],
            response: Packet::zeroed(),
            cycle: 0,
            stats: LinkStats::default(),
        };
        engine.refill_schedule();
        engine.prepare_next();
        engine
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn tx(&self) -> &TxManager {
        &self.tx
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.network.is_connected(id)
    }

    /// Owner of the slot currently on the bus.
    pub fn slot_owner(&self) -> Addr {
        self.owner
    }

    fn receive(&mut self, expected: Addr, corrupted: bool) {
        if expected == Addr::Unallocated {
            // Join entries carry their own checksums, so the corruption flag is ignored here.
            if !matches!(self.rx.packet(self.rx_idx).kind(), Err(WireError::Empty(_))) {
                self.hold(|idx| Held::Joins { idx });
            }
            return;
        }
        let Some(owner) = expected.node().filter(|id| !id.is_master()) else {
            return;
        };
        if corrupted {
            self.stats.rx_crc_failures += 1;
            trace!(%owner, "corrupted slot dropped");
            return;
        }
        let header = match Header::parse(self.rx.packet(self.rx_idx), Role::Node) {
            Ok(Header::Node(header)) => header,
            Ok(Header::Master(_)) => return,
            Err(err) => {
                self.stats.record_wire_error(&err);
                trace!(%owner, %err, "invalid packet dropped");
                return;
            }
        };
        if header.src != Addr::Node(owner) || !self.network.record_packet(owner) {
            self.stats.rx_unknown_source += 1;
            trace!(%owner, src = ?header.src, "packet from unexpected source");
            return;
        }
        self.scheduler.node_heard(owner);
        self.stats.rx_packets += 1;
        if header.kind == PacketKind::NodeData {
            self.stats.rx_data_packets += 1;
            self.accept_data(owner, header.tx_seq);
        }
        self.rx_header = Some(header);
    }

    fn accept_data(&mut self, src: NodeId, seq: u8) {
        let Some(next) = self.rx.find_free() else {
            self.stats.rx_buffer_full += 1;
            return;
        };
        if self.tx.on_receive_sequence(src, seq) {
            self.held = Some(Held::Data {
                idx: self.rx_idx,
                src,
            });
            self.rx_idx = next;
        } else {
            self.rx.release(next);
            self.stats.rx_out_of_order += 1;
            trace!(%src, seq, "out of order packet dropped");
        }
    }

    fn hold(&mut self, held: impl FnOnce(usize) -> Held) {
        match self.rx.find_free() {
            Some(next) => {
                self.held = Some(held(self.rx_idx));
                self.rx_idx = next;
            }
            None => self.stats.rx_buffer_full += 1,
        }
    }

    /// Writes the header of the frame about to go out, announcing upcoming owners.
    fn stamp(&mut self, frame: Frame) {
        let mut schedule = [Addr::Invalid; MAX_LOOKAHEAD];
        let mut acks = [0u8; MAX_LOOKAHEAD];
        for (i, owner) in self.upcoming.iter().take(self.lookahead).enumerate() {
            schedule[i] = *owner;
            if let Some(id) = owner.node().filter(|id| !id.is_master()) {
                acks[i] = self.tx.last_received(id);
            }
        }
        let packet = match frame.handle {
            Outgoing::Store(idx) => self.tx.packet_mut(idx),
            Outgoing::Scratch(i) => &mut self.scratch[i],
            Outgoing::Response => &mut self.response,
        };
        let header = Header::Master(MasterHeader {
            kind: frame.kind,
            tx_seq: packet.tx_seq(),
            data_size: packet.data_size() as u16,
            schedule,
            acks,
            dst: frame.dst,
        });
        header.write(packet);
        self.stats.record_tx(frame.kind);
    }

    fn admit_joins(&mut self, idx: usize) {
        for unique_id in join_requests(self.rx.packet(idx)) {
            self.stats.join_requests += 1;
            match self.network.register_join(unique_id) {
                Ok(Some(id)) => {
                    self.scheduler.add_node(id);
                    self.scheduler.new_node_heard();
                    self.stats.joins_admitted += 1;
                }
                Ok(None) => {}
                Err(_full) => self.stats.network_full += 1,
            }
        }
    }

    fn deliver(&mut self, idx: usize, src: NodeId) {
        if let Err(idx) = self.rx.enqueue(idx, src) {
            self.rx.release(idx);
            self.stats.rx_buffer_full += 1;
        }
    }

    fn teardown(&mut self) {
        self.evicted.clear();
        self.network.take_evictions(&mut self.evicted);
        for &id in &self.evicted {
            let freed = self.tx.remove_peer(id);
            let dropped = self.rx.remove_all(id);
            self.scheduler.remove_node(id);
            for owner in self.upcoming.iter_mut() {
                if *owner == Addr::Node(id) {
                    *owner = Addr::Invalid;
                }
            }
            self.stats.nodes_evicted += 1;
            debug!(node = %id, freed, dropped, "node state torn down");
        }
    }

    fn refill_schedule(&mut self) {
        let k = self.lookahead;
        let reserve = match self.mode {
            ChannelMode::Dual => k,
            // Room for a whole batch behind the master's next slot.
            ChannelMode::Single => k + 1,
        };
        while self.upcoming.len() <= reserve {
            self.planned.clear();
            let master_has_data = self.tx.has_sendable();
            self.scheduler
                .plan(k, self.tx.active_peers(), master_has_data, &mut self.planned);
            if self.mode == ChannelMode::Single {
                self.planned.push(Addr::MASTER);
            }
            for owner in self.planned.drain(..) {
                let pushed = self.upcoming.push(owner).is_ok();
                debug_assert!(pushed, "upcoming schedule overflow");
            }
        }
    }

    fn prepare_next(&mut self) {
        let cycle = self.cycle;
        self.cycle += 1;
        let frame = if cycle < self.reset_cycles {
            self.scratch_frame(cycle, PacketKind::MasterReset)
        } else if self.network.has_pending() && cycle % self.response_interval == 0 {
            let size = write_join_response(&mut self.response, self.network.pending_joins());
            self.response.set_tx_seq(0);
            self.response.set_data_size(size);
            Frame {
                handle: Outgoing::Response,
                kind: PacketKind::NewNodeResponse,
                dst: Addr::Unallocated,
            }
        } else if let Some(idx) = self.tx.next_packet() {
            Frame {
                handle: Outgoing::Store(idx),
                kind: PacketKind::MasterData,
                dst: Addr::Node(self.tx.packet_peer(idx)),
            }
        } else {
            self.scratch_frame(cycle, PacketKind::MasterEmpty)
        };
        self.prepared = Some(frame);
    }

    fn scratch_frame(&mut self, cycle: u64, kind: PacketKind) -> Frame {
        let i = (cycle % 2) as usize;
        let packet = &mut self.scratch[i];
        packet.set_tx_seq(0);
        packet.set_data_size(0);
        Frame {
            handle: Outgoing::Scratch(i),
            kind,
            dst: Addr::Invalid,
        }
    }

    fn frame_packet(&self, handle: Outgoing) -> &Packet {
        match handle {
            Outgoing::Store(idx) => self.tx.packet(idx),
            Outgoing::Scratch(i) => &self.scratch[i],
            Outgoing::Response => &self.response,
        }
    }
}

impl SlotEngine for MasterEngine {
    fn pre_process(&mut self, corrupted: bool) {
        self.stats.slots += 1;
        let finished = self.owner;
        if self.mode == ChannelMode::Dual || finished != Addr::MASTER {
            self.receive(finished, corrupted);
        }

        self.owner = self.upcoming.pop().unwrap_or(Addr::Invalid);
        self.sending = None;
        if self.mode == ChannelMode::Dual || self.owner == Addr::MASTER {
            if let Some(frame) = self.prepared.take() {
                self.stamp(frame);
                self.sending = Some(frame);
            }
        }
    }

    fn post_process(&mut self) {
        if let Some(header) = self.rx_header.take() {
            if let Some(src) = header.src.node() {
                let released = self.tx.on_ack(src, header.ack_seq);
                self.stats.acked_packets += released as u64;
                self.scheduler.update_buffer_level(src, header.buffer_level);
            }
        }
        match self.held.take() {
            Some(Held::Data { idx, src }) => self.deliver(idx, src),
            Some(Held::Joins { idx }) => {
                self.admit_joins(idx);
                self.rx.release(idx);
            }
            None => {}
        }

        self.teardown();
        self.refill_schedule();
        if self.mode == ChannelMode::Dual || self.upcoming.peek() == Some(&Addr::MASTER) {
            self.prepare_next();
        }

        self.stats.tx_window_restarts = self.tx.restarts();
        self.stats.rx_high_water = self.rx.high_water() as u64;
    }

    fn tx_frame(&self) -> Option<&Packet> {
        self.sending.map(|frame| self.frame_packet(frame.handle))
    }

    fn rx_frame_mut(&mut self) -> &mut Packet {
        self.rx.packet_mut(self.rx_idx)
    }

    fn slot_buffers(&mut self) -> SlotBuffers<'_> {
        let tx = match self.sending.map(|frame| frame.handle) {
            Some(Outgoing::Store(idx)) => Some(self.tx.packet(idx)),
            Some(Outgoing::Scratch(i)) => Some(&self.scratch[i]),
            Some(Outgoing::Response) => Some(&self.response),
            None => None,
        };
        SlotBuffers {
            tx,
            rx: self.rx.packet_mut(self.rx_idx),
        }
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

impl BusEndpoint for MasterEngine {
    fn allocate_tx(&mut self, dest: NodeId) -> Option<&mut [u8]> {
        if dest.is_master() || !self.network.is_connected(dest) {
            return None;
        }
        self.tx.allocate_for_send(dest).map(Packet::payload_mut)
    }

    fn submit_tx(&mut self, dest: NodeId, len: usize) -> Result<(), TxError> {
        if let Err(err) = TxError::check_len(len) {
            self.tx.cancel_reservation();
            return Err(err);
        }
        self.tx.submit(dest, PacketKind::MasterData, len);
        Ok(())
    }

    fn peek_rx(&self) -> Option<(&[u8], NodeId)> {
        self.rx.peek()
    }

    fn pop_rx(&mut self) -> bool {
        self.rx.pop()
    }

    fn pending_rx(&self) -> usize {
        self.rx.pending()
    }

    fn advance_time(&mut self, micros: u32) {
        if self.network.advance_time(micros) {
            debug!("liveness timeout pending teardown");
        }
    }

    fn connected_nodes_bitmap(&self) -> NodeBitmap {
        self.network.connected_nodes_bitmap()
    }
}
