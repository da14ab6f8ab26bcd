// Numan Thabit 2025
// network.rs - join handshake, liveness TTLs and eviction

use std::time::Duration;

use ahash::AHashMap;
use bitvec::prelude::*;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    clock::TickClock,
    table::NodeTable,
    wire::{NodeId, Packet, MAX_NODES, PAYLOAD_CAPACITY},
};

/// Bytes per join request entry: unique id plus checksum.
pub const JOIN_REQUEST_ENTRY_LEN: usize = 10;
/// Bytes per join response entry: unique id plus node id.
pub const JOIN_RESPONSE_ENTRY_LEN: usize = 9;
/// Request positions inside one join slot.
pub const JOIN_REQUEST_SLOTS: usize = PAYLOAD_CAPACITY / JOIN_REQUEST_ENTRY_LEN;
/// Admissions that fit in one response packet.
pub const MAX_JOIN_RESPONSES: usize = PAYLOAD_CAPACITY / JOIN_RESPONSE_ENTRY_LEN;

/// One bit per node identity, master at bit 0.
pub type NodeBitmap = BitArr!(for MAX_NODES, in u64, Lsb0);

/// No identity or pending-admission slot is available.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("network full: no free node identity or pending join slot")]
pub struct NetworkFull;

/// Checksum guarding a unique id inside a join request.
pub fn unique_id_checksum(unique_id: u64) -> u16 {
    unique_id
        .to_le_bytes()
        .chunks_exact(2)
        .fold(0u16, |acc, word| {
            acc.wrapping_add(u16::from_le_bytes([word[0], word[1]]))
        })
}

/// Zero and all-ones read back from an idle or shorted bus, so neither can join.
pub fn is_valid_unique_id(unique_id: u64) -> bool {
    unique_id != 0 && unique_id != u64::MAX
}

/// Fills the payload of a join request, placing `unique_id` at a random position.
pub fn write_join_request<R: Rng + ?Sized>(packet: &mut Packet, unique_id: u64, rng: &mut R) {
    let slot = rng.gen_range(0..JOIN_REQUEST_SLOTS);
    write_join_request_at(packet, unique_id, slot);
}

pub(crate) fn write_join_request_at(packet: &mut Packet, unique_id: u64, slot: usize) {
    packet.fill_payload(0xFF);
    let offset = slot * JOIN_REQUEST_ENTRY_LEN;
    let entry = &mut packet.payload_mut()[offset..offset + JOIN_REQUEST_ENTRY_LEN];
    entry[..8].copy_from_slice(&unique_id.to_le_bytes());
    entry[8..].copy_from_slice(&unique_id_checksum(unique_id).to_le_bytes());
}

/// Unique ids of every intact request in a join slot.
pub fn join_requests(packet: &Packet) -> impl Iterator<Item = u64> + '_ {
    packet.payload()[..JOIN_REQUEST_SLOTS * JOIN_REQUEST_ENTRY_LEN]
        .chunks_exact(JOIN_REQUEST_ENTRY_LEN)
        .filter_map(|entry| {
            let mut id = [0u8; 8];
            id.copy_from_slice(&entry[..8]);
            let unique_id = u64::from_le_bytes(id);
            let carried = u16::from_le_bytes([entry[8], entry[9]]);
            (is_valid_unique_id(unique_id) && unique_id_checksum(unique_id) == carried)
                .then_some(unique_id)
        })
}

/// Writes response entries into the payload and returns the data size used.
pub fn write_join_response(
    packet: &mut Packet,
    admissions: impl IntoIterator<Item = (u64, NodeId)>,
) -> usize {
    let mut size = 0;
    for (unique_id, node) in admissions.into_iter().take(MAX_JOIN_RESPONSES) {
        let entry = &mut packet.payload_mut()[size..size + JOIN_RESPONSE_ENTRY_LEN];
        entry[..8].copy_from_slice(&unique_id.to_le_bytes());
        entry[8] = node.get();
        size += JOIN_RESPONSE_ENTRY_LEN;
    }
    size
}

/// Node identity the response assigns to `unique_id`, if any.
pub fn find_join_response(packet: &Packet, unique_id: u64) -> Option<NodeId> {
    packet
        .data()
        .chunks_exact(JOIN_RESPONSE_ENTRY_LEN)
        .find(|entry| entry[..8] == unique_id.to_le_bytes())
        .and_then(|entry| NodeId::new(entry[8]))
        .filter(|id| !id.is_master())
}

/// Membership lifecycle of one identity. Absence from the table means unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Admitted, waiting to hear the node use its identity.
    Provisional { ttl: u8 },
    Active { ttl: u8 },
    /// Timed out; torn down on the next teardown pass.
    PendingRemoval,
    /// Torn down; held back from reuse for a while.
    Retired { ticks: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub unique_id: u64,
    pub state: MemberState,
}

impl Member {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            MemberState::Provisional { .. } | MemberState::Active { .. }
        )
    }
}

/// Limits and timers for [`NetworkManager`].
#[derive(Debug, Clone, Copy)]
pub struct MembershipSettings {
    pub max_nodes: usize,
    pub max_pending: usize,
    pub node_ttl: u8,
    pub provisional_ttl: u8,
    pub retire_ticks: u8,
    pub tick: Duration,
}

/// Master-side membership table.
#[derive(Debug)]
pub struct NetworkManager {
    settings: MembershipSettings,
    members: NodeTable<Member>,
    pending: AHashMap<u64, NodeId>,
    clock: TickClock,
}

impl NetworkManager {
    pub fn new(settings: MembershipSettings) -> Self {
        assert!(
            settings.max_nodes <= MAX_NODES,
            "max_nodes {} exceeds identity space",
            settings.max_nodes
        );
        Self {
            members: NodeTable::new(),
            pending: AHashMap::with_capacity(settings.max_pending),
            clock: TickClock::new(settings.tick),
            settings,
        }
    }

    /// Admits `unique_id`. Returns the new identity, or `None` if it is already pending.
    pub fn register_join(&mut self, unique_id: u64) -> Result<Option<NodeId>, NetworkFull> {
        if self.pending.contains_key(&unique_id) {
            return Ok(None);
        }
        if self.pending.len() >= self.settings.max_pending {
            warn!(unique_id, pending = self.pending.len(), "join refused: pending table full");
            return Err(NetworkFull);
        }
        let Some(id) = (1..self.settings.max_nodes)
            .filter_map(|raw| NodeId::new(raw as u8))
            .find(|id| !self.members.contains(*id))
        else {
            warn!(unique_id, "join refused: no free node identity");
            return Err(NetworkFull);
        };
        self.members.insert(
            id,
            Member {
                unique_id,
                state: MemberState::Provisional {
                    ttl: self.settings.provisional_ttl,
                },
            },
        );
        self.pending.insert(unique_id, id);
        info!(unique_id, node = %id, "join admitted");
        Ok(Some(id))
    }

    /// Refreshes the TTL of `src`. Returns false when `src` is not a live member.
    pub fn record_packet(&mut self, src: NodeId) -> bool {
        let node_ttl = self.settings.node_ttl;
        let Some(member) = self.members.get_mut(src) else {
            return false;
        };
        match member.state {
            MemberState::Provisional { .. } => {
                member.state = MemberState::Active { ttl: node_ttl };
                self.remove_pending(src);
                true
            }
            MemberState::Active { .. } => {
                member.state = MemberState::Active { ttl: node_ttl };
                true
            }
            MemberState::PendingRemoval | MemberState::Retired { .. } => false,
        }
    }

    /// Drops the pending admission that handed out `node`.
    pub fn remove_pending(&mut self, node: NodeId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|_, id| *id != node);
        self.pending.len() != before
    }

    /// Feeds elapsed time in. Returns true when some node timed out.
    pub fn advance_time(&mut self, micros: u32) -> bool {
        let mut expired = false;
        for _ in 0..self.clock.advance(micros) {
            expired |= self.tick();
        }
        expired
    }

    fn tick(&mut self) -> bool {
        let mut expired = false;
        self.members.retain_mut(|_, member| {
            member.state = match member.state {
                MemberState::Provisional { ttl } | MemberState::Active { ttl } if ttl <= 1 => {
                    expired = true;
                    MemberState::PendingRemoval
                }
                MemberState::Provisional { ttl } => MemberState::Provisional { ttl: ttl - 1 },
                MemberState::Active { ttl } => MemberState::Active { ttl: ttl - 1 },
                MemberState::PendingRemoval => MemberState::PendingRemoval,
                // Identity is free again.
                MemberState::Retired { ticks } if ticks <= 1 => return false,
                MemberState::Retired { ticks } => MemberState::Retired { ticks: ticks - 1 },
            };
            true
        });
        expired
    }

    /// Moves timed-out members to retirement and reports them for teardown.
    pub fn take_evictions(&mut self, out: &mut Vec<NodeId>) {
        let retire = self.settings.retire_ticks;
        let start = out.len();
        for (id, member) in self.members.iter_mut() {
            if member.state == MemberState::PendingRemoval {
                member.state = MemberState::Retired { ticks: retire };
                out.push(id);
            }
        }
        for &id in &out[start..] {
            self.remove_pending(id);
            if retire == 0 {
                self.members.remove(id);
            }
            warn!(node = %id, "node evicted after liveness timeout");
        }
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.members.get(id).is_some_and(Member::is_connected)
    }

    pub fn connected_count(&self) -> usize {
        self.members.iter().filter(|(_, m)| m.is_connected()).count()
    }

    /// Master plus every provisional or active node.
    pub fn connected_nodes_bitmap(&self) -> NodeBitmap {
        let mut bits = NodeBitmap::ZERO;
        bits.set(NodeId::MASTER.index(), true);
        for (id, member) in self.members.iter() {
            if member.is_connected() {
                bits.set(id.index(), true);
            }
        }
        bits
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Admissions not yet confirmed, in identity order.
    pub fn pending_joins(&self) -> Vec<(u64, NodeId)> {
        let mut joins: Vec<_> = self.pending.iter().map(|(uid, id)| (*uid, *id)).collect();
        joins.sort_by_key(|(_, id)| *id);
        joins
    }
}
