// node.rs - node side of the slot pipeline
// Numan Thabit 2025
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::{
    api::{BusEndpoint, SlotBuffers, SlotEngine, TxError},
    clock::TickClock,
    config::{ChannelMode, Config},
    metrics::LinkStats,
    network::{find_join_response, is_valid_unique_id, write_join_request, NodeBitmap},
    ring::RingBuffer,
    rx::RxManager,
    window::{TxManager, TxSettings},
    wire::{
        Addr, Header, MasterHeader, NodeHeader, NodeId, Packet, PacketKind, Role, MAX_LOOKAHEAD,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outgoing {
    Store(usize),
    Keepalive,
    Join,
}

/// A node on the bus: joins, follows the announced schedule, talks only to the master.
#[derive(Debug)]
pub struct NodeEngine {
    mode: ChannelMode,
    unique_id: u64,
    id: Option<NodeId>,
    tx_settings: TxSettings,
    tx: TxManager,
    rx: RxManager,
    rx_idx: usize,
    /// Announced owners of the coming slots with the master's ack for each.
    schedule: RingBuffer<(Addr, u8)>,
    rx_header: Option<MasterHeader>,
    held: Option<usize>,
    sending: Option<Outgoing>,
    transmitted: bool,
    keepalive: Packet,
    join: Packet,
    rng: StdRng,
    join_skip: u8,
    join_window: u8,
    join_backoff_max: u8,
    clock: TickClock,
    self_ttl: u8,
    self_ttl_max: u8,
    expired: bool,
    stats: LinkStats,
}

impl NodeEngine {
    /// Creates a node identified during joins by `unique_id`.
    ///
    /// Panics when `unique_id` is zero or all ones.
    pub fn new(config: &Config, unique_id: u64) -> Self {
        assert!(
            is_valid_unique_id(unique_id),
            "unique id {unique_id:#x} is reserved"
        );
        let node = &config.node;
        let tx_settings = TxSettings {
            store_capacity: node.tx_packets,
            window_size: config.bus.window_size,
            retransmit_pause: config.bus.retransmit_pause,
            burst_size: 1,
            max_active: 1,
        };
        let mut rx = RxManager::new(node.rx_packets);
        let Some(rx_idx) = rx.find_free() else {
            unreachable!("fresh rx pool has free buffers");
        };
        Self {
            mode: config.bus.channel_mode,
            unique_id,
            id: None,
            tx_settings,
            tx: TxManager::new(tx_settings),
            rx,
            rx_idx,
            schedule: RingBuffer::with_capacity(MAX_LOOKAHEAD),
            rx_header: None,
            held: None,
            sending: None,
            transmitted: false,
            keepalive: Packet::zeroed(),
            join: Packet::zeroed(),
            rng: StdRng::seed_from_u64(unique_id),
            join_skip: 0,
            join_window: 1,
            join_backoff_max: node.join_backoff_max.max(1),
            clock: TickClock::new(config.bus.ttl_tick()),
            self_ttl: node.self_ttl_ticks,
            self_ttl_max: node.self_ttl_ticks,
            expired: false,
            stats: LinkStats::default(),
        }
    }

    /// Identity handed out by the master, once joined.
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn is_joined(&self) -> bool {
        self.id.is_some()
    }

    pub fn tx(&self) -> &TxManager {
        &self.tx
    }

    fn receive(&mut self, corrupted: bool) {
        if corrupted {
            self.stats.rx_crc_failures += 1;
            return;
        }
        let packet = self.rx.packet(self.rx_idx);
        if self.mode == ChannelMode::Single
            && matches!(packet.kind().map(PacketKind::sender), Ok(Some(Role::Node)))
        {
            // Another node's slot on the shared medium.
            return;
        }
        let header = match Header::parse(packet, Role::Master) {
            Ok(Header::Master(header)) => header,
            Ok(Header::Node(_)) => return,
            Err(err) => {
                self.stats.record_wire_error(&err);
                trace!(%err, "invalid master packet dropped");
                return;
            }
        };
        self.stats.rx_packets += 1;

        self.schedule.clear();
        for (owner, ack) in header.schedule.into_iter().zip(header.acks) {
            let _ = self.schedule.push((owner, ack));
        }
        if let Some(me) = self.id {
            if header.schedule.contains(&Addr::Node(me)) {
                self.self_ttl = self.self_ttl_max;
            }
        }

        match header.kind {
            PacketKind::MasterData if self.id.is_some_and(|me| header.dst == Addr::Node(me)) => {
                self.stats.rx_data_packets += 1;
                self.accept_data(header.tx_seq);
            }
            PacketKind::NewNodeResponse if self.id.is_none() => self.hold(),
            _ => {}
        }
        self.rx_header = Some(header);
    }

    fn accept_data(&mut self, seq: u8) {
        let Some(next) = self.rx.find_free() else {
            self.stats.rx_buffer_full += 1;
            return;
        };
        if self.tx.on_receive_sequence(NodeId::MASTER, seq) {
            self.held = Some(self.rx_idx);
            self.rx_idx = next;
        } else {
            self.rx.release(next);
            self.stats.rx_out_of_order += 1;
            trace!(seq, "out of order packet dropped");
        }
    }

    fn hold(&mut self) {
        match self.rx.find_free() {
            Some(next) => {
                self.held = Some(self.rx_idx);
                self.rx_idx = next;
            }
            None => self.stats.rx_buffer_full += 1,
        }
    }

    fn select(&mut self, owner: Addr, ack: u8) -> Option<Outgoing> {
        let me = self.id.filter(|_| !self.expired);
        match (owner, me) {
            (Addr::Node(slot), Some(me)) if slot == me => {
                let released = self.tx.on_ack(NodeId::MASTER, ack);
                self.stats.acked_packets += released as u64;
                let out = match self.tx.next_to_send(NodeId::MASTER) {
                    Some(idx) => Outgoing::Store(idx),
                    None => Outgoing::Keepalive,
                };
                self.stamp(out, me);
                Some(out)
            }
            (Addr::Unallocated, None) => self.join_attempt(),
            _ => None,
        }
    }

    fn stamp(&mut self, out: Outgoing, me: NodeId) {
        let buffer_level = u8::try_from(self.tx.queued(NodeId::MASTER)).unwrap_or(u8::MAX);
        let ack_seq = self.tx.last_received(NodeId::MASTER);
        let (packet, kind) = match out {
            Outgoing::Store(idx) => (self.tx.packet_mut(idx), PacketKind::NodeData),
            Outgoing::Keepalive => {
                self.keepalive.set_tx_seq(0);
                self.keepalive.set_data_size(0);
                (&mut self.keepalive, PacketKind::NodeEmpty)
            }
            Outgoing::Join => return,
        };
        Header::Node(NodeHeader {
            kind,
            tx_seq: packet.tx_seq(),
            data_size: packet.data_size() as u16,
            ack_seq,
            src: Addr::Node(me),
            buffer_level,
        })
        .write(packet);
        self.stats.record_tx(kind);
    }

    fn join_attempt(&mut self) -> Option<Outgoing> {
        if self.join_skip > 0 {
            self.join_skip -= 1;
            return None;
        }
        write_join_request(&mut self.join, self.unique_id, &mut self.rng);
        // Identical on every joining node so overlapping headers survive the wired AND.
        Header::Node(NodeHeader {
            kind: PacketKind::NewNodeRequest,
            tx_seq: 0,
            data_size: 0,
            ack_seq: 0,
            src: Addr::Unallocated,
            buffer_level: 0,
        })
        .write(&mut self.join);
        self.join_skip = self.rng.gen_range(0..self.join_window);
        self.join_window = self.join_window.saturating_mul(2).min(self.join_backoff_max);
        self.stats.record_tx(PacketKind::NewNodeRequest);
        Some(Outgoing::Join)
    }

    fn adopt(&mut self, idx: usize) {
        if self.id.is_some() {
            return;
        }
        if let Some(id) = find_join_response(self.rx.packet(idx), self.unique_id) {
            info!(unique_id = self.unique_id, node = %id, "joined bus");
            self.id = Some(id);
            self.self_ttl = self.self_ttl_max;
            self.join_window = 1;
            self.join_skip = 0;
        }
    }

    /// Gives up the current identity and all send state, ready to rejoin.
    fn leave(&mut self) {
        self.id = None;
        self.tx = TxManager::new(self.tx_settings);
        self.sending = None;
        self.schedule.clear();
        self.join_window = 1;
        self.join_skip = 0;
        self.self_ttl = self.self_ttl_max;
        self.expired = false;
    }

    fn frame_packet(&self, out: Outgoing) -> &Packet {
        match out {
            Outgoing::Store(idx) => self.tx.packet(idx),
            Outgoing::Keepalive => &self.keepalive,
            Outgoing::Join => &self.join,
        }
    }
}

impl SlotEngine for NodeEngine {
    fn pre_process(&mut self, corrupted: bool) {
        self.stats.slots += 1;
        self.rx_header = None;
        // On a shared medium the transmitter hears nothing useful in its own slot.
        if self.mode == ChannelMode::Dual || !self.transmitted {
            self.receive(corrupted);
        }
        let (owner, ack) = self.schedule.pop().unwrap_or((Addr::Invalid, 0));
        self.sending = self.select(owner, ack);
        self.transmitted = self.sending.is_some();
    }

    fn post_process(&mut self) {
        let held = self.held.take();
        if let Some(header) = self.rx_header.take() {
            match (header.kind, held) {
                (PacketKind::MasterData, Some(idx)) => {
                    if let Err(idx) = self.rx.enqueue(idx, NodeId::MASTER) {
                        self.rx.release(idx);
                        self.stats.rx_buffer_full += 1;
                    }
                }
                (PacketKind::NewNodeResponse, Some(idx)) => {
                    self.adopt(idx);
                    self.rx.release(idx);
                }
                (PacketKind::MasterReset, _) => {
                    if let Some(id) = self.id {
                        debug!(node = %id, "master reset, rejoining");
                        self.leave();
                    }
                }
                (_, Some(idx)) => self.rx.release(idx),
                (_, None) => {}
            }
        } else if let Some(idx) = held {
            self.rx.release(idx);
        }

        if self.expired {
            if let Some(id) = self.id {
                warn!(node = %id, "master silent past liveness timeout, rejoining");
            }
            self.leave();
        }
        self.stats.tx_window_restarts = self.tx.restarts();
        self.stats.rx_high_water = self.rx.high_water() as u64;
    }

    fn tx_frame(&self) -> Option<&Packet> {
        self.sending.map(|out| self.frame_packet(out))
    }

    fn rx_frame_mut(&mut self) -> &mut Packet {
        self.rx.packet_mut(self.rx_idx)
    }

    fn slot_buffers(&mut self) -> SlotBuffers<'_> {
        let tx = match self.sending {
            Some(Outgoing::Store(idx)) => Some(self.tx.packet(idx)),
            Some(Outgoing::Keepalive) => Some(&self.keepalive),
            Some(Outgoing::Join) => Some(&self.join),
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

impl BusEndpoint for NodeEngine {
    fn allocate_tx(&mut self, dest: NodeId) -> Option<&mut [u8]> {
        if !dest.is_master() {
            return None;
        }
        self.tx.allocate_for_send(dest).map(Packet::payload_mut)
    }

    fn submit_tx(&mut self, dest: NodeId, len: usize) -> Result<(), TxError> {
        if let Err(err) = TxError::check_len(len) {
            self.tx.cancel_reservation();
            return Err(err);
        }
        self.tx.submit(dest, PacketKind::NodeData, len);
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
        let ticks = self.clock.advance(micros);
        if ticks == 0 || self.id.is_none() {
            return;
        }
        let ticks = u8::try_from(ticks).unwrap_or(u8::MAX);
        self.self_ttl = self.self_ttl.saturating_sub(ticks);
        if self.self_ttl == 0 {
            self.expired = true;
        }
    }

    fn connected_nodes_bitmap(&self) -> NodeBitmap {
        let mut bits = NodeBitmap::ZERO;
        if let Some(id) = self.id {
            bits.set(NodeId::MASTER.index(), true);
            bits.set(id.index(), true);
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{join_requests, write_join_response};

    const UID: u64 = 0xfeed_0001;

    fn node() -> NodeEngine {
        NodeEngine::new(&Config::default(), UID)
    }

    fn write_master(packet: &mut Packet, kind: PacketKind, tx_seq: u8, size: usize, dst: Addr) {
        Header::Master(MasterHeader {
            kind,
            tx_seq,
            data_size: size as u16,
            schedule: only(Addr::Invalid),
            acks: [0; MAX_LOOKAHEAD],
            dst,
        })
        .write(packet);
    }

    fn master_packet(kind: PacketKind, schedule: [Addr; MAX_LOOKAHEAD], dst: Addr) -> Packet {
        let mut packet = Packet::zeroed();
        Header::Master(MasterHeader {
            kind,
            tx_seq: 0,
            data_size: 0,
            schedule,
            acks: [0; MAX_LOOKAHEAD],
            dst,
        })
        .write(&mut packet);
        packet
    }

    fn slot(node: &mut NodeEngine, packet: Packet) {
        *node.rx_frame_mut() = packet;
        node.pre_process(false);
        node.post_process();
    }

    fn only(first: Addr) -> [Addr; MAX_LOOKAHEAD] {
        [first, Addr::Invalid, Addr::Invalid, Addr::Invalid]
    }

    fn joined(id: u8) -> NodeEngine {
        let mut node = node();
        let assigned = NodeId::new(id).unwrap();
        let mut response = Packet::zeroed();
        let size = write_join_response(&mut response, [(UID + 1, NodeId::FIRST), (UID, assigned)]);
        write_master(&mut response, PacketKind::NewNodeResponse, 0, size, Addr::Unallocated);
        slot(&mut node, response);
        assert_eq!(node.id(), Some(assigned));
        node
    }

    #[test]
    fn joins_in_unallocated_slot() {
        let mut node = node();
        slot(&mut node, master_packet(PacketKind::MasterEmpty, only(Addr::Unallocated), Addr::Invalid));
        let request = node.tx_frame().expect("join request sent").clone();
        assert_eq!(request.kind(), Ok(PacketKind::NewNodeRequest));
        assert_eq!(join_requests(&request).collect::<Vec<_>>(), vec![UID]);
    }

    #[test]
    fn join_retries_back_off() {
        let mut node = node();
        let mut sent = 0;
        for _ in 0..40 {
            slot(&mut node, master_packet(PacketKind::MasterEmpty, only(Addr::Unallocated), Addr::Invalid));
            if node.is_tx_slot() {
                sent += 1;
            }
        }
        assert!(sent >= 5 && sent < 40, "sent {sent} requests");
    }

    #[test]
    fn adopts_id_from_matching_response_only() {
        let node = joined(7);
        assert!(node.connected_nodes_bitmap()[7]);
        assert!(node.connected_nodes_bitmap()[0]);
        assert!(!node.connected_nodes_bitmap()[1]);
    }

    #[test]
    fn scheduled_node_sends_keepalive_with_ack() {
        let mut node = joined(3);
        let me = Addr::Node(NodeId::new(3).unwrap());
        slot(&mut node, master_packet(PacketKind::MasterEmpty, only(me), Addr::Invalid));
        match Header::parse(node.tx_frame().expect("keepalive"), Role::Node) {
            Ok(Header::Node(header)) => {
                assert_eq!(header.kind, PacketKind::NodeEmpty);
                assert_eq!(header.src, me);
                assert_eq!(header.ack_seq, 0);
                assert_eq!(header.buffer_level, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn scheduled_node_sends_queued_data() {
        let mut node = joined(3);
        let me = Addr::Node(NodeId::new(3).unwrap());
        assert!(node.send(NodeId::MASTER, &[0xCD; 10]).unwrap());
        assert!(node.send(NodeId::MASTER, &[0xCE; 4]).unwrap());
        slot(&mut node, master_packet(PacketKind::MasterEmpty, only(me), Addr::Invalid));
        let frame = node.tx_frame().expect("data").clone();
        match Header::parse(&frame, Role::Node) {
            Ok(Header::Node(header)) => {
                assert_eq!(header.kind, PacketKind::NodeData);
                assert_eq!(header.tx_seq, 1);
                assert_eq!(header.buffer_level, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(frame.data(), &[0xCD; 10]);
    }

    #[test]
    fn delivers_in_order_master_data() {
        let mut node = joined(2);
        let me = Addr::Node(NodeId::new(2).unwrap());
        for (seq, byte) in [(1u8, 0xA1u8), (3, 0xA3), (2, 0xA2)] {
            let mut packet = Packet::zeroed();
            packet.fill_payload(byte);
            write_master(&mut packet, PacketKind::MasterData, seq, 5, me);
            slot(&mut node, packet);
        }
        let mut got = Vec::new();
        while let Some(frame) = node.take_rx() {
            assert_eq!(frame.src, NodeId::MASTER);
            got.push(frame.payload[0]);
        }
        assert_eq!(got, vec![0xA1, 0xA2]);
        assert_eq!(node.stats().rx_out_of_order, 1);
    }

    #[test]
    fn master_reset_drops_identity() {
        let mut node = joined(4);
        slot(&mut node, master_packet(PacketKind::MasterReset, only(Addr::Invalid), Addr::Invalid));
        assert_eq!(node.id(), None);
    }

    #[test]
    fn silent_master_expires_identity() {
        let mut node = joined(4);
        for _ in 0..3_000 {
            node.advance_time(200);
            slot(&mut node, Packet::idle());
        }
        assert_eq!(node.id(), None);
        assert!(node.stats().rx_empty > 0);
    }

    #[test]
    fn single_channel_ignores_overheard_nodes() {
        let mut node = NodeEngine::new(&Config::single_channel(), UID);
        let mut other = Packet::zeroed();
        Header::Node(NodeHeader {
            kind: PacketKind::NodeData,
            tx_seq: 1,
            data_size: 0,
            ack_seq: 0,
            src: Addr::Node(NodeId::FIRST),
            buffer_level: 0,
        })
        .write(&mut other);
        slot(&mut node, other);
        assert_eq!(node.stats().rx_packets, 0);
        assert_eq!(node.stats().rx_invalid_kind, 0);
    }
}
