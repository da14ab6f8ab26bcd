// Numan Thabit 2025
// sched/mod.rs - slot owner selection for the master

pub mod gap;
pub mod lookahead;

use self::{
    gap::JoinGap,
    lookahead::{plan_batch, Candidate},
};
use crate::{
    config::{ChannelMode, SchedulerConfig},
    queue::NodeQueue,
    ring::RingBuffer,
    table::NodeTable,
    wire::{Addr, NodeId, MAX_NODES},
};

/// Per-node scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeSlotState {
    /// Last reported depth of the node's send queue, minus slots granted since.
    pub buffer_level: u8,
    pub waited: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Ack,
    Backlog,
    Master,
}

impl Turn {
    fn next(self) -> Self {
        match self {
            Turn::Ack => Turn::Backlog,
            Turn::Backlog => Turn::Master,
            Turn::Master => Turn::Ack,
        }
    }
}

/// Decides who owns upcoming slots.
#[derive(Debug)]
pub struct Scheduler {
    cfg: SchedulerConfig,
    mode: ChannelMode,
    nodes: NodeTable<NodeSlotState>,
    active: NodeQueue,
    backlogged: NodeQueue,
    /// Admitted nodes not yet heard with their new identity.
    fresh: NodeQueue,
    fresh_wait: u16,
    turn: Turn,
    gap: JoinGap,
    ack_cursor: Option<NodeId>,
    recent: RingBuffer<NodeId>,
    candidates: Vec<Candidate>,
    plan: Vec<NodeId>,
    plan_pos: usize,
    overdue_len: usize,
}

impl Scheduler {
    pub fn new(cfg: &SchedulerConfig, mode: ChannelMode) -> Self {
        Self {
            gap: JoinGap::new(
                cfg.unallocated_gap_min,
                cfg.unallocated_gap_max,
                cfg.gap_backoff_rounds,
            ),
            recent: RingBuffer::with_capacity(cfg.ack_service_interval.max(1)),
            cfg: cfg.clone(),
            mode,
            nodes: NodeTable::new(),
            active: NodeQueue::with_capacity(MAX_NODES),
            backlogged: NodeQueue::with_capacity(MAX_NODES),
            fresh: NodeQueue::with_capacity(MAX_NODES),
            fresh_wait: 0,
            turn: Turn::Ack,
            ack_cursor: None,
            candidates: Vec::with_capacity(MAX_NODES),
            plan: Vec::new(),
            plan_pos: 0,
            overdue_len: 0,
        }
    }

    /// Starts scheduling `id` for liveness service.
    ///
    /// The node gets a priority slot every `provisional_service_interval`
    /// slots until [`Scheduler::node_heard`] reports it.
    pub fn add_node(&mut self, id: NodeId) {
        self.nodes.insert(id, NodeSlotState::default());
        self.active.insert(id);
        self.fresh.insert(id);
    }

    /// A packet arrived from `id` under its current identity.
    pub fn node_heard(&mut self, id: NodeId) {
        self.fresh.remove(id);
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.nodes.remove(id);
        self.active.remove(id);
        self.backlogged.remove(id);
        self.fresh.remove(id);
        if self.ack_cursor == Some(id) {
            self.ack_cursor = None;
        }
    }

    /// Records the send-queue depth a node reported.
    pub fn update_buffer_level(&mut self, id: NodeId, level: u8) {
        let Some(state) = self.nodes.get_mut(id) else {
            return;
        };
        state.buffer_level = level;
        if level > 0 {
            self.backlogged.insert(id);
        } else {
            self.backlogged.remove(id);
        }
    }

    /// A join was observed; shorten the join-slot gap again.
    pub fn new_node_heard(&mut self) {
        self.gap.new_node_heard();
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSlotState> {
        self.nodes.get(id)
    }

    pub fn active_nodes(&self) -> &NodeQueue {
        &self.active
    }

    /// Nodes admitted but not heard from yet.
    pub fn provisional_nodes(&self) -> &NodeQueue {
        &self.fresh
    }

    pub fn join_gap(&self) -> u16 {
        self.gap.gap()
    }

    /// Decides the owners of the next `slots` slots and appends them to `out`.
    ///
    /// `awaiting_ack` lists peers the master has unacknowledged data for.
    pub fn plan(
        &mut self,
        slots: usize,
        awaiting_ack: &NodeQueue,
        master_has_data: bool,
        out: &mut Vec<Addr>,
    ) {
        let age = u16::try_from(slots).unwrap_or(u16::MAX);
        for (_, state) in self.nodes.iter_mut() {
            state.waited = state.waited.saturating_add(age);
        }

        let max_latency = self.cfg.max_slots_per_node_tx_chance;
        self.candidates.clear();
        for (id, state) in self.nodes.iter() {
            if state.waited >= max_latency {
                self.candidates.push(candidate(id, state));
            }
        }
        for id in self.backlogged.iter() {
            if let Some(state) = self.nodes.get(id) {
                if state.waited < max_latency {
                    self.candidates.push(candidate(id, state));
                }
            }
        }
        self.overdue_len = plan_batch(&mut self.candidates, slots, max_latency, &mut self.plan);
        self.plan_pos = 0;

        for _ in 0..slots {
            let owner = self.decide(awaiting_ack, master_has_data);
            self.mark_scheduled(owner);
            out.push(owner);
        }
    }

    fn decide(&mut self, awaiting_ack: &NodeQueue, master_has_data: bool) -> Addr {
        if self.gap.tick() {
            return Addr::Unallocated;
        }
        if let Some(id) = self.fresh_candidate() {
            return Addr::Node(id);
        }
        if self.plan_pos < self.overdue_len {
            self.plan_pos += 1;
            return Addr::Node(self.plan[self.plan_pos - 1]);
        }
        for _ in 0..3 {
            let turn = self.turn;
            self.turn = turn.next();
            let pick = match turn {
                Turn::Ack => self.ack_candidate(awaiting_ack),
                Turn::Backlog => self.backlog_candidate(),
                Turn::Master => {
                    (self.mode == ChannelMode::Single && master_has_data).then_some(Addr::MASTER)
                }
            };
            if let Some(owner) = pick {
                return owner;
            }
        }
        match self.active.advance() {
            Some(id) => Addr::Node(id),
            None => Addr::Invalid,
        }
    }

    /// Next provisional node owed a priority slot, if any.
    fn fresh_candidate(&mut self) -> Option<NodeId> {
        if self.fresh.is_empty() {
            self.fresh_wait = 0;
            return None;
        }
        self.fresh_wait = self.fresh_wait.saturating_add(1);
        if self.fresh_wait < self.cfg.provisional_service_interval {
            return None;
        }
        self.fresh_wait = 0;
        self.fresh.advance()
    }

    fn ack_candidate(&mut self, awaiting_ack: &NodeQueue) -> Option<Addr> {
        let id = awaiting_ack
            .after(self.ack_cursor)
            .find(|id| self.nodes.contains(*id) && !self.recent.iter().any(|r| r == id))?;
        self.ack_cursor = Some(id);
        Some(Addr::Node(id))
    }

    fn backlog_candidate(&mut self) -> Option<Addr> {
        let id = *self.plan.get(self.plan_pos)?;
        self.plan_pos += 1;
        Some(Addr::Node(id))
    }

    fn mark_scheduled(&mut self, owner: Addr) {
        let Some(id) = owner.node().filter(|id| !id.is_master()) else {
            return;
        };
        let Some(state) = self.nodes.get_mut(id) else {
            return;
        };
        state.waited = 0;
        state.buffer_level = state.buffer_level.saturating_sub(1);
        if state.buffer_level == 0 {
            self.backlogged.remove(id);
        }
        if self.recent.is_full() {
            self.recent.pop();
        }
        let _ = self.recent.push(id);
    }
}

fn candidate(id: NodeId, state: &NodeSlotState) -> Candidate {
    Candidate {
        id,
        buffer_level: state.buffer_level,
        waited: state.waited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u8) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn scheduler(mode: ChannelMode) -> Scheduler {
        Scheduler::new(&SchedulerConfig::default(), mode)
    }

    fn decide_one(s: &mut Scheduler, awaiting: &NodeQueue) -> Addr {
        let mut out = Vec::new();
        s.plan(1, awaiting, false, &mut out);
        out[0]
    }

    fn settle_gap(s: &mut Scheduler) {
        let none = NodeQueue::with_capacity(1);
        for _ in 0..200_000 {
            decide_one(s, &none);
        }
    }

    #[test]
    fn join_slots_are_frequent_at_start() {
        let mut s = scheduler(ChannelMode::Dual);
        let none = NodeQueue::with_capacity(1);
        let joins = (0..100)
            .filter(|_| decide_one(&mut s, &none) == Addr::Unallocated)
            .count();
        assert!(joins > 48, "only {joins} join slots");
    }

    #[test]
    fn join_slots_back_off_when_quiet() {
        let mut s = scheduler(ChannelMode::Dual);
        settle_gap(&mut s);
        assert_eq!(s.join_gap(), 80);
        let none = NodeQueue::with_capacity(1);
        let joins = (0..500)
            .filter(|_| decide_one(&mut s, &none) == Addr::Unallocated)
            .count();
        assert!((6..=7).contains(&joins), "{joins} join slots");

        s.new_node_heard();
        assert_eq!(s.join_gap(), 2);
    }

    #[test]
    fn idle_nodes_are_serviced_in_turn() {
        let mut s = scheduler(ChannelMode::Dual);
        for raw in 1..=5 {
            s.add_node(node(raw));
            s.node_heard(node(raw));
        }
        let none = NodeQueue::with_capacity(1);
        let order: Vec<u8> = (0..60)
            .filter_map(|_| decide_one(&mut s, &none).node())
            .map(NodeId::get)
            .collect();
        let expected: Vec<u8> = (1..=5).cycle().take(order.len()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn backlogged_nodes_share_fairly() {
        let mut s = scheduler(ChannelMode::Dual);
        let nodes: Vec<_> = (1..=5).map(node).collect();
        for id in &nodes {
            s.add_node(*id);
            s.node_heard(*id);
        }
        let none = NodeQueue::with_capacity(1);
        let mut counts = [0usize; 6];
        for _ in 0..1000 {
            for id in &nodes {
                s.update_buffer_level(*id, 10);
            }
            if let Some(id) = decide_one(&mut s, &none).node() {
                counts[id.index()] += 1;
            }
        }
        for id in &nodes {
            assert!(counts[id.index()] > 700 / nodes.len(), "{counts:?}");
        }
    }

    #[test]
    fn ack_peer_gets_regular_slots() {
        let mut s = scheduler(ChannelMode::Dual);
        for raw in 1..=5 {
            s.add_node(node(raw));
            s.node_heard(node(raw));
        }
        let mut awaiting = NodeQueue::with_capacity(4);
        awaiting.insert(node(1));
        let count = (0..1000)
            .filter(|_| decide_one(&mut s, &awaiting) == Addr::Node(node(1)))
            .count();
        assert!(count > 1000 / 8 - 10, "node 1 got {count} slots");
    }

    #[test]
    fn heavy_feeder_cannot_starve_idle_nodes() {
        let mut s = scheduler(ChannelMode::Dual);
        for raw in 1..=5 {
            s.add_node(node(raw));
            s.node_heard(node(raw));
        }
        let none = NodeQueue::with_capacity(1);
        let mut last_seen = [0usize; 6];
        let mut worst = [0usize; 6];
        for slot in 1..=2000 {
            s.update_buffer_level(node(1), 200);
            let mut out = Vec::new();
            s.plan(1, &none, false, &mut out);
            if let Some(id) = out[0].node() {
                let i = id.index();
                worst[i] = worst[i].max(slot - last_seen[i]);
                last_seen[i] = slot;
            }
        }
        let bound = 2 * usize::from(SchedulerConfig::default().max_slots_per_node_tx_chance);
        for raw in 2..=5 {
            assert!(worst[raw] <= bound, "node {raw} waited {}", worst[raw]);
        }
    }

    #[test]
    fn single_channel_gives_master_turns() {
        let mut s = scheduler(ChannelMode::Single);
        settle_gap(&mut s);
        s.add_node(node(1));
        let none = NodeQueue::with_capacity(1);
        let mut out = Vec::new();
        s.plan(4, &none, true, &mut out);
        assert!(out.contains(&Addr::MASTER));

        let mut dual = scheduler(ChannelMode::Dual);
        dual.add_node(node(1));
        out.clear();
        dual.plan(4, &none, true, &mut out);
        assert!(!out.contains(&Addr::MASTER));
    }

    #[test]
    fn provisional_node_is_served_ahead_of_rotation() {
        let mut s = scheduler(ChannelMode::Dual);
        for raw in 1..=200 {
            s.add_node(node(raw));
            s.node_heard(node(raw));
        }
        let fresh = node(201);
        s.add_node(fresh);
        assert!(s.provisional_nodes().contains(fresh));

        let none = NodeQueue::with_capacity(1);
        let served = (0..100)
            .filter(|_| decide_one(&mut s, &none) == Addr::Node(fresh))
            .count();
        assert!(served >= 5, "provisional node got {served} slots");

        s.node_heard(fresh);
        assert!(s.provisional_nodes().is_empty());
        let served = (0..100)
            .filter(|_| decide_one(&mut s, &none) == Addr::Node(fresh))
            .count();
        assert!(served <= 1, "heard node still prioritised: {served}");
    }

    #[test]
    fn removed_node_is_never_scheduled() {
        let mut s = scheduler(ChannelMode::Dual);
        s.add_node(node(1));
        s.add_node(node(2));
        s.update_buffer_level(node(2), 5);
        s.remove_node(node(2));
        let none = NodeQueue::with_capacity(1);
        let mut out = Vec::new();
        s.plan(4, &none, false, &mut out);
        s.plan(4, &none, false, &mut out);
        assert!(!out.contains(&Addr::Node(node(2))));
    }
}
