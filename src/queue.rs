// Numan Thabit 2025
// queue.rs - bounded node set with a round-robin cursor

use crate::wire::NodeId;

/// Small unordered set of nodes. Membership changes compact in place.
#[derive(Debug, Clone)]
pub struct NodeQueue {
    members: Vec<NodeId>,
    capacity: usize,
    cursor: usize,
}

impl NodeQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Adds `id` if absent. Returns false only when the set is full.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if self.contains(id) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.members.push(id);
        true
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(pos) = self.members.iter().position(|member| *member == id) else {
            return false;
        };
        self.members.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        true
    }

    /// Returns the member under the cursor and moves the cursor on.
    pub fn advance(&mut self) -> Option<NodeId> {
        if self.members.is_empty() {
            return None;
        }
        let id = self.members[self.cursor];
        self.cursor = (self.cursor + 1) % self.members.len();
        Some(id)
    }

    /// Members in rotation order starting right after `prev`, or from the front.
    pub fn after(&self, prev: Option<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        let start = prev
            .and_then(|p| self.members.iter().position(|member| *member == p))
            .map_or(0, |pos| pos + 1);
        let len = self.members.len();
        (0..len).map(move |i| self.members[(start + i) % len])
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.cursor = 0;
    }
}
