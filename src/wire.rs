// Slot packet layout: fixed header, role views, and header checksum.
// Numan Thabit 2025

use std::{convert::TryFrom, fmt};

use thiserror::Error;

/// Protocol version carried in the high nibble of the first header byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bus clock in MHz.
pub const SPI_FREQ_MHZ: usize = 12;

/// Duration of one slot in microseconds.
pub const SLOT_TIME_US: usize = 200;

/// Bytes that fit in one slot at the configured clock.
pub const PACKET_SIZE: usize = SPI_FREQ_MHZ * SLOT_TIME_US / 8;

/// Upper bound on schedule entries a master header can announce.
pub const MAX_LOOKAHEAD: usize = 4;

/// Fixed header length shared by both roles.
pub const HEADER_LEN: usize = 14;

/// Payload bytes available after the header.
pub const PAYLOAD_CAPACITY: usize = PACKET_SIZE - HEADER_LEN;

/// Number of addressable node identities, master included.
pub const MAX_NODES: usize = 250;

const OFF_VERSION_KIND: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_SIZE_HI: usize = 2;
const OFF_SIZE_LO: usize = 3;
const OFF_ROLE: usize = 4;
const OFF_CHECKSUM: usize = HEADER_LEN - 1;

// Non-zero seed so an all-zero header never validates.
const CHECKSUM_SEED: u8 = 0xA5;

const RAW_UNALLOCATED: u8 = 0xFE;
const RAW_INVALID: u8 = 0xFF;

/// Packet kind carried in the low nibble of the first header byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Null = 0,
    MasterData = 1,
    NodeData = 2,
    MasterEmpty = 3,
    NodeEmpty = 4,
    NewNodeRequest = 5,
    NewNodeResponse = 6,
    MasterReset = 7,
}

impl PacketKind {
    /// Role that is allowed to transmit this kind, `None` for [`PacketKind::Null`].
    pub const fn sender(self) -> Option<Role> {
        match self {
            PacketKind::Null => None,
            PacketKind::MasterData
            | PacketKind::MasterEmpty
            | PacketKind::NewNodeResponse
            | PacketKind::MasterReset => Some(Role::Master),
            PacketKind::NodeData | PacketKind::NodeEmpty | PacketKind::NewNodeRequest => {
                Some(Role::Node)
            }
        }
    }

    /// Whether the kind carries sequenced application data.
    pub const fn is_data(self) -> bool {
        matches!(self, PacketKind::MasterData | PacketKind::NodeData)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Null),
            1 => Ok(PacketKind::MasterData),
            2 => Ok(PacketKind::NodeData),
            3 => Ok(PacketKind::MasterEmpty),
            4 => Ok(PacketKind::NodeEmpty),
            5 => Ok(PacketKind::NewNodeRequest),
            6 => Ok(PacketKind::NewNodeResponse),
            7 => Ok(PacketKind::MasterReset),
            other => Err(WireError::InvalidKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> Self {
        kind as u8
    }
}

/// Which side of the bus produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Node,
}

/// Allocated node identity. `0` is the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    /// Identity of the bus master.
    pub const MASTER: NodeId = NodeId(0);
    /// First identity handed out to joining nodes.
    pub const FIRST: NodeId = NodeId(1);

    /// Wraps a raw identity, rejecting the sentinel range.
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_NODES {
            Some(NodeId(raw))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            f.write_str("master")
        } else {
            write!(f, "node{}", self.0)
        }
    }
}

/// Address as it appears on the wire: a node, the join slot, or nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    Node(NodeId),
    /// Shared join slot, or the broadcast destination of join responses.
    Unallocated,
    /// Nobody; idle slots and unused schedule entries.
    Invalid,
}

impl Addr {
    pub const MASTER: Addr = Addr::Node(NodeId::MASTER);

    pub const fn node(self) -> Option<NodeId> {
        match self {
            Addr::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl From<NodeId> for Addr {
    fn from(id: NodeId) -> Self {
        Addr::Node(id)
    }
}

impl From<u8> for Addr {
    fn from(raw: u8) -> Self {
        match raw {
            RAW_UNALLOCATED => Addr::Unallocated,
            other => NodeId::new(other).map_or(Addr::Invalid, Addr::Node),
        }
    }
}

impl From<Addr> for u8 {
    fn from(addr: Addr) -> Self {
        match addr {
            Addr::Node(id) => id.get(),
            Addr::Unallocated => RAW_UNALLOCATED,
            Addr::Invalid => RAW_INVALID,
        }
    }
}

/// Wire-level error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Nothing was driven onto the bus during the slot.
    #[error("no packet on the bus (first byte {0:#04x})")]
    Empty(u8),

    /// Sender speaks a different protocol version.
    #[error("protocol version {found} does not match {expected}")]
    VersionMismatch { found: u8, expected: u8 },

    /// Packet kind nibble outside the known range.
    #[error("unknown packet kind {0}")]
    InvalidKind(u8),

    /// Header bytes do not add up to the carried checksum.
    #[error("header checksum mismatch: computed {computed:#04x}, carried {carried:#04x}")]
    Checksum { computed: u8, carried: u8 },

    /// Declared data size exceeds what the slot can carry.
    #[error("data size {0} exceeds payload capacity")]
    DataSize(usize),

    /// Packet kind is not one the expected role transmits.
    #[error("{kind:?} is not sent by the {expected:?}")]
    WrongRole { kind: PacketKind, expected: Role },
}

/// Computes the one-byte header checksum over everything but the checksum slot.
pub fn header_checksum(header: &[u8]) -> u8 {
    header[..OFF_CHECKSUM]
        .iter()
        .fold(CHECKSUM_SEED, |acc, byte| acc.wrapping_add(*byte))
}

/// One slot's worth of bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: [u8; PACKET_SIZE],
}

impl Packet {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0; PACKET_SIZE],
        }
    }

    /// What a receiver sees when nobody drives the pulled-up bus.
    pub fn idle() -> Self {
        Self {
            bytes: [0xFF; PACKET_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PACKET_SIZE] {
        &mut self.bytes
    }

    /// Decodes the kind, checking the protocol version first.
    pub fn kind(&self) -> Result<PacketKind, WireError> {
        let raw = self.bytes[OFF_VERSION_KIND];
        if raw == 0x00 || raw == 0xFF {
            return Err(WireError::Empty(raw));
        }
        let version = raw >> 4;
        if version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }
        PacketKind::try_from(raw & 0x0F)
    }

    pub fn set_kind(&mut self, kind: PacketKind) {
        self.bytes[OFF_VERSION_KIND] = (PROTOCOL_VERSION << 4) | u8::from(kind);
    }

    pub fn tx_seq(&self) -> u8 {
        self.bytes[OFF_SEQ]
    }

    pub fn set_tx_seq(&mut self, seq: u8) {
        self.bytes[OFF_SEQ] = seq;
    }

    pub fn data_size(&self) -> usize {
        usize::from(u16::from_be_bytes([
            self.bytes[OFF_SIZE_HI],
            self.bytes[OFF_SIZE_LO],
        ]))
    }

    pub fn set_data_size(&mut self, size: usize) {
        assert!(
            size <= PAYLOAD_CAPACITY,
            "data size {size} exceeds payload capacity"
        );
        let [hi, lo] = (size as u16).to_be_bytes();
        self.bytes[OFF_SIZE_HI] = hi;
        self.bytes[OFF_SIZE_LO] = lo;
    }

    /// Whole payload area regardless of the declared size.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[HEADER_LEN..]
    }

    /// Payload trimmed to the declared data size.
    pub fn data(&self) -> &[u8] {
        let len = self.data_size().min(PAYLOAD_CAPACITY);
        &self.bytes[HEADER_LEN..HEADER_LEN + len]
    }

    pub fn fill_payload(&mut self, byte: u8) {
        self.payload_mut().fill(byte);
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind())
            .field("tx_seq", &self.tx_seq())
            .field("data_size", &self.data_size())
            .finish()
    }
}

/// Header written by the master: look-ahead schedule plus destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterHeader {
    pub kind: PacketKind,
    pub tx_seq: u8,
    pub data_size: u16,
    /// Owners of the next slots, nearest first.
    pub schedule: [Addr; MAX_LOOKAHEAD],
    /// Last in-order sequence the master received from each scheduled node.
    pub acks: [u8; MAX_LOOKAHEAD],
    pub dst: Addr,
}

/// Header written by a node: cumulative ack plus backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub kind: PacketKind,
    pub tx_seq: u8,
    pub data_size: u16,
    pub ack_seq: u8,
    pub src: Addr,
    pub buffer_level: u8,
}

/// Decoded header, tagged by the role that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Master(MasterHeader),
    Node(NodeHeader),
}

impl Header {
    /// Decodes and validates the header of `packet`, expecting it from `sender`.
    pub fn parse(packet: &Packet, sender: Role) -> Result<Self, WireError> {
        let kind = packet.kind()?;
        let bytes = packet.as_bytes();
        let computed = header_checksum(&bytes[..HEADER_LEN]);
        let carried = bytes[OFF_CHECKSUM];
        if computed != carried {
            return Err(WireError::Checksum { computed, carried });
        }
        let size = packet.data_size();
        if size > PAYLOAD_CAPACITY {
            return Err(WireError::DataSize(size));
        }
        if kind.sender() != Some(sender) {
            return Err(WireError::WrongRole {
                kind,
                expected: sender,
            });
        }

        let role = &bytes[OFF_ROLE..OFF_CHECKSUM];
        let tx_seq = packet.tx_seq();
        let data_size = size as u16;
        Ok(match sender {
            Role::Master => Header::Master(MasterHeader {
                kind,
                tx_seq,
                data_size,
                schedule: std::array::from_fn(|i| Addr::from(role[i])),
                acks: std::array::from_fn(|i| role[MAX_LOOKAHEAD + i]),
                dst: Addr::from(role[2 * MAX_LOOKAHEAD]),
            }),
            Role::Node => Header::Node(NodeHeader {
                kind,
                tx_seq,
                data_size,
                ack_seq: role[0],
                src: Addr::from(role[1]),
                buffer_level: role[2],
            }),
        })
    }

    /// Writes every header byte, checksum last.
    pub fn write(&self, packet: &mut Packet) {
        let (kind, tx_seq, data_size) = (self.kind(), self.tx_seq(), self.data_size());
        packet.set_kind(kind);
        packet.set_tx_seq(tx_seq);
        packet.set_data_size(usize::from(data_size));

        let bytes = packet.as_bytes_mut();
        let role = &mut bytes[OFF_ROLE..OFF_CHECKSUM];
        role.fill(0);
        match self {
            Header::Master(hdr) => {
                for (i, addr) in hdr.schedule.iter().enumerate() {
                    role[i] = u8::from(*addr);
                }
                role[MAX_LOOKAHEAD..2 * MAX_LOOKAHEAD].copy_from_slice(&hdr.acks);
                role[2 * MAX_LOOKAHEAD] = u8::from(hdr.dst);
            }
            Header::Node(hdr) => {
                role[0] = hdr.ack_seq;
                role[1] = u8::from(hdr.src);
                role[2] = hdr.buffer_level;
            }
        }
        bytes[OFF_CHECKSUM] = header_checksum(&bytes[..HEADER_LEN]);
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Header::Master(hdr) => hdr.kind,
            Header::Node(hdr) => hdr.kind,
        }
    }

    pub fn tx_seq(&self) -> u8 {
        match self {
            Header::Master(hdr) => hdr.tx_seq,
            Header::Node(hdr) => hdr.tx_seq,
        }
    }

    pub fn data_size(&self) -> u16 {
        match self {
            Header::Master(hdr) => hdr.data_size,
            Header::Node(hdr) => hdr.data_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn master_header() -> MasterHeader {
        MasterHeader {
            kind: PacketKind::MasterData,
            tx_seq: 9,
            data_size: 120,
            schedule: [
                Addr::Node(NodeId::FIRST),
                Addr::Unallocated,
                Addr::MASTER,
                Addr::Invalid,
            ],
            acks: [4, 0, 0, 0],
            dst: Addr::Node(NodeId(3)),
        }
    }

    #[test]
    fn packet_fits_slot() {
        assert_eq!(PACKET_SIZE, 300);
        assert_eq!(PAYLOAD_CAPACITY, PACKET_SIZE - HEADER_LEN);
        assert!(HEADER_LEN > OFF_ROLE + 2 * MAX_LOOKAHEAD + 1);
    }

    #[test]
    fn master_header_round_trip() {
        let hdr = Header::Master(master_header());
        let mut packet = Packet::zeroed();
        hdr.write(&mut packet);
        assert_eq!(Header::parse(&packet, Role::Master), Ok(hdr));
        assert_eq!(packet.data().len(), 120);
    }

    #[test]
    fn node_header_round_trip() {
        let hdr = Header::Node(NodeHeader {
            kind: PacketKind::NodeEmpty,
            tx_seq: 255,
            data_size: 0,
            ack_seq: 17,
            src: Addr::Node(NodeId(42)),
            buffer_level: 6,
        });
        let mut packet = Packet::idle();
        hdr.write(&mut packet);
        assert_eq!(Header::parse(&packet, Role::Node), Ok(hdr));
    }

    #[test]
    fn idle_and_zeroed_bus_are_empty() {
        assert_eq!(
            Header::parse(&Packet::idle(), Role::Master),
            Err(WireError::Empty(0xFF))
        );
        assert_eq!(
            Header::parse(&Packet::zeroed(), Role::Node),
            Err(WireError::Empty(0x00))
        );
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut packet = Packet::zeroed();
        Header::Master(master_header()).write(&mut packet);
        packet.as_bytes_mut()[0] = (2 << 4) | u8::from(PacketKind::MasterData);
        assert_eq!(
            Header::parse(&packet, Role::Master),
            Err(WireError::VersionMismatch {
                found: 2,
                expected: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn wrong_role_rejected() {
        let mut packet = Packet::zeroed();
        Header::Master(master_header()).write(&mut packet);
        assert!(matches!(
            Header::parse(&packet, Role::Node),
            Err(WireError::WrongRole { .. })
        ));
    }

    #[test]
    fn sentinel_addresses_map_both_ways() {
        assert_eq!(Addr::from(0xFE), Addr::Unallocated);
        assert_eq!(Addr::from(0xFF), Addr::Invalid);
        assert_eq!(Addr::from(250), Addr::Invalid);
        assert_eq!(u8::from(Addr::Unallocated), 0xFE);
        assert_eq!(Addr::from(0), Addr::MASTER);
        assert!(NodeId::new(249).is_some());
        assert!(NodeId::new(250).is_none());
    }

    proptest! {
        #[test]
        fn single_byte_header_damage_is_caught(offset in 0usize..HEADER_LEN, flip in 1u8..=255) {
            let mut packet = Packet::zeroed();
            Header::Master(master_header()).write(&mut packet);
            packet.as_bytes_mut()[offset] ^= flip;
            prop_assert!(Header::parse(&packet, Role::Master).is_err());
        }

        #[test]
        fn payload_does_not_affect_header(payload in prop::collection::vec(any::<u8>(), PAYLOAD_CAPACITY)) {
            let mut packet = Packet::zeroed();
            packet.payload_mut().copy_from_slice(&payload);
            let hdr = Header::Master(master_header());
            hdr.write(&mut packet);
            prop_assert_eq!(Header::parse(&packet, Role::Master), Ok(hdr));
            prop_assert_eq!(packet.payload(), &payload[..]);
        }
    }
}
