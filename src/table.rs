// Numan Thabit 2025
// table.rs - per-node slot table keyed by NodeId

use crate::wire::{NodeId, MAX_NODES};

/// Fixed table with one optional entry per node identity.
#[derive(Debug, Clone)]
pub struct NodeTable<T> {
    entries: Box<[Option<T>]>,
}

impl<T> NodeTable<T> {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_NODES).map(|_| None).collect(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.entries[id.index()].as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.entries[id.index()].as_mut()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries[id.index()].is_some()
    }

    /// Stores `value`, returning whatever occupied the slot before.
    pub fn insert(&mut self, id: NodeId, value: T) -> Option<T> {
        self.entries[id.index()].replace(value)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        self.entries[id.index()].take()
    }

    pub fn get_or_insert_with(&mut self, id: NodeId, init: impl FnOnce() -> T) -> &mut T {
        self.entries[id.index()].get_or_insert_with(init)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| Some((node_at(idx), slot.as_ref()?)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut T)> + '_ {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| Some((node_at(idx), slot.as_mut()?)))
    }

    /// Visits every entry in identity order, dropping those `keep` rejects.
    pub fn retain_mut(&mut self, mut keep: impl FnMut(NodeId, &mut T) -> bool) {
        for (idx, slot) in self.entries.iter_mut().enumerate() {
            if let Some(value) = slot {
                if !keep(node_at(idx), value) {
                    *slot = None;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

impl<T> Default for NodeTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn node_at(idx: usize) -> NodeId {
    // Table length is MAX_NODES, so every index is a valid identity.
    match NodeId::new(idx as u8) {
        Some(id) => id,
        None => unreachable!("node table index {idx} outside identity range"),
    }
}
