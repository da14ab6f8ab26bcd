// Numan Thabit 2025
// sim.rs - in-process bus wiring one master to a set of nodes

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    api::{BusEndpoint, SlotEngine},
    config::{ChannelMode, Config},
    master::MasterEngine,
    node::NodeEngine,
    wire::{NodeId, Packet, SLOT_TIME_US},
};

struct Station {
    engine: NodeEngine,
    online: bool,
    corrupted: bool,
}

/// Open-drain bus: every driver can only pull bits low.
fn wired_and(bus: &mut Packet, frame: &Packet) {
    for (line, bit) in bus.as_bytes_mut().iter_mut().zip(frame.as_bytes()) {
        *line &= *bit;
    }
}

/// What one receiver latches, possibly damaged in transit.
fn latch(rng: &mut StdRng, drop_rate: f64, wire: &Packet) -> (Packet, bool) {
    if drop_rate > 0.0 && rng.gen_bool(drop_rate) {
        (Packet::idle(), true)
    } else {
        (wire.clone(), false)
    }
}

struct Bus {
    mode: ChannelMode,
    master: MasterEngine,
    master_corrupted: bool,
    nodes: Vec<Station>,
    rng: StdRng,
    drop_rate: f64,
}

impl Bus {
    fn new(config: &Config, uids: &[u64], drop_rate: f64, seed: u64) -> Self {
        Self {
            mode: config.bus.channel_mode,
            master: MasterEngine::new(config),
            master_corrupted: false,
            nodes: uids
                .iter()
                .map(|&uid| Station {
                    engine: NodeEngine::new(config, uid),
                    online: true,
                    corrupted: false,
                })
                .collect(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate,
        }
    }

    fn slot(&mut self) {
        self.master.pre_process(self.master_corrupted);
        for station in self.nodes.iter_mut().filter(|s| s.online) {
            station.engine.pre_process(station.corrupted);
        }

        let mut downlink = Packet::idle();
        let mut uplink = Packet::idle();
        if let Some(frame) = self.master.tx_frame() {
            wired_and(&mut downlink, frame);
        }
        for station in self.nodes.iter().filter(|s| s.online) {
            if let Some(frame) = station.engine.tx_frame() {
                wired_and(&mut uplink, frame);
            }
        }
        if self.mode == ChannelMode::Single {
            wired_and(&mut uplink, &downlink);
            downlink = uplink.clone();
        }

        let (packet, corrupted) = latch(&mut self.rng, self.drop_rate, &uplink);
        *self.master.rx_frame_mut() = packet;
        self.master_corrupted = corrupted;
        for station in self.nodes.iter_mut().filter(|s| s.online) {
            let (packet, corrupted) = latch(&mut self.rng, self.drop_rate, &downlink);
            *station.engine.rx_frame_mut() = packet;
            station.corrupted = corrupted;
        }

        self.master.post_process();
        for station in self.nodes.iter_mut().filter(|s| s.online) {
            station.engine.post_process();
        }

        // Timers keep running on powered-down nodes.
        self.master.advance_time(SLOT_TIME_US as u32);
        for station in &mut self.nodes {
            station.engine.advance_time(SLOT_TIME_US as u32);
        }
    }

    fn run(&mut self, slots: usize) {
        for _ in 0..slots {
            self.slot();
        }
    }

    fn run_until(&mut self, max_slots: usize, done: impl Fn(&Bus) -> bool) -> bool {
        for _ in 0..max_slots {
            if done(&*self) {
                return true;
            }
            self.slot();
        }
        done(&*self)
    }

    fn joined(&self) -> bool {
        self.nodes.iter().filter(|s| s.online).all(|s| {
            s.engine
                .id()
                .is_some_and(|id| self.master.is_connected(id))
        })
    }

    fn set_online(&mut self, station: usize, online: bool) {
        let station = &mut self.nodes[station];
        station.online = online;
        *station.engine.rx_frame_mut() = Packet::idle();
        station.corrupted = false;
    }

    /// Sends `count` tagged payloads each way between the master and one node,
    /// returning what each side delivered.
    fn exchange(
        &mut self,
        station: usize,
        count: u8,
        max_slots: usize,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let id = self.nodes[station].engine.id().expect("node joined");
        let (mut down_sent, mut up_sent) = (0u8, 0u8);
        let (mut down_got, mut up_got) = (Vec::new(), Vec::new());
        for _ in 0..max_slots {
            if down_sent < count && self.master.send(id, &[0xAB, down_sent]).unwrap() {
                down_sent += 1;
            }
            let node = &mut self.nodes[station].engine;
            if up_sent < count && node.send(NodeId::MASTER, &[0xCD, up_sent]).unwrap() {
                up_sent += 1;
            }
            while let Some(frame) = node.take_rx() {
                assert_eq!(frame.src, NodeId::MASTER);
                down_got.push(frame.payload.to_vec());
            }
            while let Some(frame) = self.master.take_rx() {
                if frame.src == id {
                    up_got.push(frame.payload.to_vec());
                }
            }
            if down_got.len() == usize::from(count) && up_got.len() == usize::from(count) {
                break;
            }
            self.slot();
        }
        (down_got, up_got)
    }
}

fn tagged(tag: u8, count: u8) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![tag, i]).collect()
}

fn uids(n: u64) -> Vec<u64> {
    (1..=n).map(|i| 0x5eed_0000_0000_0000 | (i * 0x1_0001)).collect()
}

#[test]
fn nodes_join_with_distinct_ids() {
    let mut bus = Bus::new(&Config::default(), &uids(5), 0.0, 7);
    assert!(bus.run_until(5_000, Bus::joined), "nodes failed to join");

    let mut ids: Vec<_> = bus.nodes.iter().filter_map(|s| s.engine.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    let bitmap = bus.master.connected_nodes_bitmap();
    assert!(bitmap[NodeId::MASTER.index()]);
    for id in &ids {
        assert!(bitmap[id.index()], "{id} missing from bitmap");
    }
    assert_eq!(bus.master.network().connected_count(), 5);
}

#[test]
fn data_round_trips_in_order_despite_drops() {
    let mut bus = Bus::new(&Config::default(), &uids(3), 0.05, 11);
    assert!(bus.run_until(10_000, Bus::joined), "nodes failed to join");

    let (down, up) = bus.exchange(0, 30, 30_000);
    assert_eq!(down, tagged(0xAB, 30));
    assert_eq!(up, tagged(0xCD, 30));
    assert!(bus.master.stats().rx_crc_failures > 0);
    assert!(bus.joined());
}

#[test]
fn silent_node_is_evicted_and_rejoins() {
    let mut bus = Bus::new(&Config::default(), &uids(2), 0.0, 3);
    assert!(bus.run_until(5_000, Bus::joined));
    let old = bus.nodes[1].engine.id().expect("joined");

    // Delivered to the master but never collected by the application.
    for i in 0..2 {
        assert!(bus.nodes[1].engine.send(NodeId::MASTER, &[0xEE, i]).unwrap());
    }
    assert!(bus.run_until(2_000, |bus| bus.master.pending_rx() == 2));

    bus.set_online(1, false);
    for i in 0..5 {
        assert!(bus.master.send(old, &[0xAB, i]).unwrap());
    }
    assert_eq!(bus.master.tx().queued(old), 5);

    bus.run(2_500);
    assert!(!bus.master.is_connected(old));
    assert!(bus.master.stats().nodes_evicted >= 1);
    assert!(bus.nodes[0].engine.is_joined());
    assert_eq!(bus.master.tx().queued(old), 0);
    assert_eq!(bus.master.tx().store().in_use(), 0);
    assert_eq!(bus.master.pending_rx(), 0);
    assert!(bus.master.take_rx().is_none());

    bus.set_online(1, true);
    assert!(bus.run_until(5_000, Bus::joined), "node failed to rejoin");
    let (down, up) = bus.exchange(1, 5, 10_000);
    assert_eq!(down, tagged(0xAB, 5));
    assert_eq!(up, tagged(0xCD, 5));
}

#[test]
fn large_network_keeps_every_node() {
    let mut bus = Bus::new(&Config::default(), &uids(64), 0.0, 17);
    assert!(bus.run_until(100_000, Bus::joined), "nodes failed to join");
    let ids: Vec<_> = bus.nodes.iter().map(|s| s.engine.id()).collect();
    let evicted = bus.master.stats().nodes_evicted;

    bus.run(5_000);
    assert!(bus.joined());
    assert_eq!(bus.nodes.iter().map(|s| s.engine.id()).collect::<Vec<_>>(), ids);
    assert_eq!(bus.master.stats().nodes_evicted, evicted);
    assert_eq!(bus.master.network().connected_count(), 64);
}

#[test]
fn single_channel_round_trip() {
    let mut bus = Bus::new(&Config::single_channel(), &uids(2), 0.0, 5);
    assert!(bus.run_until(10_000, Bus::joined), "nodes failed to join");

    let (down, up) = bus.exchange(0, 10, 20_000);
    assert_eq!(down, tagged(0xAB, 10));
    assert_eq!(up, tagged(0xCD, 10));
    assert_eq!(bus.master.stats().rx_crc_failures, 0);
}

#[test]
fn single_channel_round_trip_despite_drops() {
    let mut bus = Bus::new(&Config::single_channel(), &uids(3), 0.1, 13);
    assert!(bus.run_until(20_000, Bus::joined), "nodes failed to join");

    let (down, up) = bus.exchange(2, 30, 60_000);
    assert_eq!(down, tagged(0xAB, 30));
    assert_eq!(up, tagged(0xCD, 30));
    assert!(bus.master.stats().rx_crc_failures > 0);
}
