// TDMA bus protocol core public library surface.
// Numan Thabit 2025

pub mod wire;

pub mod ring;

pub mod table;

pub mod queue;

pub mod store;

pub mod window;

pub mod rx;

pub mod clock;

pub mod config;

pub mod network;

pub mod sched;

pub mod metrics;

pub mod api;

pub mod master;

pub mod node;

#[cfg(feature = "driver")]
pub mod runtime;

#[cfg(test)]
mod sim;

pub use config::{
    BusConfig, ChannelMode, Config, ConfigError, MasterConfig, NodeConfig, SchedulerConfig,
};

pub use wire::{
    header_checksum, Addr, Header, MasterHeader, NodeHeader, NodeId, Packet, PacketKind, Role,
    WireError, HEADER_LEN, MAX_LOOKAHEAD, MAX_NODES, PACKET_SIZE, PAYLOAD_CAPACITY,
    PROTOCOL_VERSION, SLOT_TIME_US,
};

pub use api::{BusEndpoint, Phy, ReceivedFrame, SlotBuffers, SlotEngine, TxError};

pub use master::MasterEngine;

pub use node::NodeEngine;

pub use network::{MemberState, NetworkFull, NetworkManager, NodeBitmap};

pub use sched::{NodeSlotState, Scheduler};

pub use window::{PeerWindow, TxManager, TxSettings};

pub use metrics::{LinkStats, Metrics, MetricsError};

#[cfg(feature = "driver")]
pub use runtime::{BusDriver, DriverConfig, DriverError};
