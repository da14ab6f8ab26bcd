// Numan Thabit 2025
// rx.rs - receive buffer pool and ordered delivery queue

use crate::{
    ring::RingBuffer,
    wire::{NodeId, Packet},
};

#[derive(Debug, Clone)]
struct RxEntry {
    in_use: bool,
    src: NodeId,
    packet: Packet,
}

/// Receive buffers plus the queue of packets awaiting the application.
#[derive(Debug)]
pub struct RxManager {
    pool: Vec<RxEntry>,
    // Entries of evicted peers are nulled in place and skipped on peek.
    queue: RingBuffer<Option<usize>>,
    high_water: usize,
}

impl RxManager {
    /// `capacity` buffers; two are always held back for in-flight receives.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 3, "rx pool needs at least three buffers");
        let pool = (0..capacity)
            .map(|_| RxEntry {
                in_use: false,
                src: NodeId::MASTER,
                packet: Packet::idle(),
            })
            .collect();
        Self {
            pool,
            queue: RingBuffer::with_capacity(capacity - 2),
            high_water: 0,
        }
    }

    /// Claims a buffer for the next physical receive.
    pub fn find_free(&mut self) -> Option<usize> {
        if self.queue.is_full() {
            return None;
        }
        let idx = self.pool.iter().position(|entry| !entry.in_use)?;
        self.pool[idx].in_use = true;
        Some(idx)
    }

    /// Returns a buffer that will not be delivered.
    pub fn release(&mut self, idx: usize) {
        self.pool[idx].in_use = false;
    }

    /// Queues buffer `idx` from `src` for delivery. Hands `idx` back when the queue is full.
    pub fn enqueue(&mut self, idx: usize, src: NodeId) -> Result<(), usize> {
        self.pool[idx].src = src;
        match self.queue.push(Some(idx)) {
            Ok(()) => {
                self.high_water = self.high_water.max(self.pending());
                Ok(())
            }
            Err(_) => Err(idx),
        }
    }

    /// Oldest undelivered payload and its source.
    pub fn peek(&self) -> Option<(&[u8], NodeId)> {
        let idx = *self.queue.iter().flatten().next()?;
        let entry = &self.pool[idx];
        Some((entry.packet.data(), entry.src))
    }

    /// Releases the oldest undelivered packet. Returns false when nothing was queued.
    pub fn pop(&mut self) -> bool {
        self.skip_tombstones();
        match self.queue.pop() {
            Some(Some(idx)) => {
                self.release(idx);
                true
            }
            _ => false,
        }
    }

    /// Drops every undelivered packet that came from `src`.
    pub fn remove_all(&mut self, src: NodeId) -> usize {
        let mut removed = 0;
        for slot in self.queue.iter_mut() {
            if let Some(idx) = *slot {
                if self.pool[idx].src == src {
                    self.pool[idx].in_use = false;
                    *slot = None;
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn packet(&self, idx: usize) -> &Packet {
        &self.pool[idx].packet
    }

    pub fn packet_mut(&mut self, idx: usize) -> &mut Packet {
        &mut self.pool[idx].packet
    }

    /// Undelivered packets, tombstones excluded.
    pub fn pending(&self) -> usize {
        self.queue.iter().filter(|slot| slot.is_some()).count()
    }

    /// Deepest the delivery queue has been.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    fn skip_tombstones(&mut self) {
        while let Some(None) = self.queue.peek() {
            self.queue.pop();
        }
    }
}
