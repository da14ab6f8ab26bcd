// Configuration schema for the bus engines.
// Numan Thabit 2025

use std::{
    env, fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::wire::{MAX_LOOKAHEAD, MAX_NODES, SLOT_TIME_US};

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Settings both roles must agree on.
    pub bus: BusConfig,
    /// Master-only sizing and liveness.
    pub master: MasterConfig,
    /// Node-only sizing and liveness.
    pub node: NodeConfig,
    /// Slot allocation policy used by the master.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads configuration from `TDMABUS_CONFIG` if set, otherwise returns defaults.
    ///
    /// `TDMABUS_CHANNEL_MODE` overrides the configured channel mode.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match env::var("TDMABUS_CONFIG") {
            Ok(path) => Self::from_path(path)?,
            Err(_missing) => Self::default(),
        };
        cfg.bus.channel_mode = cfg.active_mode();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Defaults for a shared half-duplex medium.
    pub fn single_channel() -> Self {
        let mut cfg = Self::default();
        cfg.bus.channel_mode = ChannelMode::Single;
        cfg.bus.lookahead = MAX_LOOKAHEAD;
        cfg
    }

    /// Channel mode from `TDMABUS_CHANNEL_MODE`, falling back to the configured one.
    pub fn active_mode(&self) -> ChannelMode {
        env::var("TDMABUS_CHANNEL_MODE")
            .ok()
            .and_then(|value| ChannelMode::from_str(&value).ok())
            .unwrap_or(self.bus.channel_mode)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate().map_err(ConfigError::Validation)?;
        self.master.validate().map_err(ConfigError::Validation)?;
        self.node.validate().map_err(ConfigError::Validation)?;
        self.scheduler.validate().map_err(ConfigError::Validation)?;
        if self.node.self_ttl_ticks >= self.master.node_ttl_ticks {
            return Err(ConfigError::Validation(
                "node.self_ttl_ticks must be below master.node_ttl_ticks".into(),
            ));
        }
        let rotation = self.rotation_ticks();
        let shortest = self.master.provisional_ttl_ticks.min(self.node.self_ttl_ticks);
        if u64::from(shortest) <= rotation {
            return Err(ConfigError::Validation(format!(
                "master.provisional_ttl_ticks and node.self_ttl_ticks must exceed {rotation} ticks, \
                 the longest a node can go unscheduled with {} nodes",
                self.master.max_nodes
            )));
        }
        Ok(())
    }

    /// Worst-case slots between two transmit chances of one node.
    ///
    /// Assumes every identity is in use, join slots come as often as
    /// `unallocated_gap_min` allows and a provisional node is being served.
    /// In single-channel mode each batch of `lookahead` slots also ends in a
    /// master slot.
    pub fn rotation_slots(&self) -> u64 {
        let nodes = self.master.max_nodes as u64;
        let join_gap = u64::from(self.scheduler.unallocated_gap_min);
        let fresh = u64::from(self.scheduler.provisional_service_interval);
        let mut slots = (nodes * join_gap).div_ceil(join_gap - 1);
        slots = (slots * fresh).div_ceil(fresh - 1);
        if self.bus.channel_mode == ChannelMode::Single {
            let k = self.bus.lookahead as u64;
            slots = (slots * (k + 1)).div_ceil(k);
        }
        slots
    }

    /// [`Config::rotation_slots`] in liveness ticks, rounded up.
    pub fn rotation_ticks(&self) -> u64 {
        (self.rotation_slots() * SLOT_TIME_US as u64).div_ceil(self.bus.ttl_tick_us)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Whether the two directions share one medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Master and scheduled node transmit simultaneously on separate lines.
    #[default]
    Dual,
    /// One transmitter per slot on a shared line.
    Single,
}

impl FromStr for ChannelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dual" | "full" => Ok(ChannelMode::Dual),
            "single" | "half" => Ok(ChannelMode::Single),
            other => Err(ConfigError::Validation(format!(
                "unknown channel mode '{other}'; expected dual or single"
            ))),
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Dual => f.write_str("dual"),
            ChannelMode::Single => f.write_str("single"),
        }
    }
}

/// Settings shared by every participant on the bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub channel_mode: ChannelMode,
    /// Schedule entries announced per master packet.
    pub lookahead: usize,
    /// Packets in flight per peer before the sender pauses.
    pub window_size: u8,
    /// Stale acks tolerated before the window rewinds.
    pub retransmit_pause: u8,
    /// Period of the liveness tick in microseconds.
    pub ttl_tick_us: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_mode: ChannelMode::Dual,
            lookahead: 1,
            window_size: 3,
            retransmit_pause: 3,
            ttl_tick_us: 2_000,
        }
    }
}

impl BusConfig {
    pub fn ttl_tick(&self) -> Duration {
        Duration::from_micros(self.ttl_tick_us)
    }

    fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_LOOKAHEAD).contains(&self.lookahead) {
            return Err(format!("bus.lookahead must lie within [1, {MAX_LOOKAHEAD}]"));
        }
        if self.window_size == 0 || self.window_size >= 128 {
            return Err("bus.window_size must lie within [1, 127]".into());
        }
        if self.retransmit_pause == 0 {
            return Err("bus.retransmit_pause must be > 0".into());
        }
        if self.ttl_tick_us == 0 {
            return Err("bus.ttl_tick_us must be > 0".into());
        }
        Ok(())
    }
}

/// Master sizing and membership policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Outbound packet buffers.
    pub tx_packets: usize,
    /// Inbound packet buffers.
    pub rx_packets: usize,
    /// Highest node identity handed out, exclusive.
    pub max_nodes: usize,
    /// Peers that may hold unacknowledged packets at once.
    pub max_active_tx: usize,
    /// Consecutive packets sent to one peer before rotating.
    pub burst_size: u8,
    /// Join admissions awaiting their first packet.
    pub max_pending_joins: usize,
    /// Liveness ticks an active node survives without being heard.
    pub node_ttl_ticks: u8,
    /// Liveness ticks a provisional node gets to speak with its new identity.
    pub provisional_ttl_ticks: u8,
    /// Liveness ticks before an evicted identity is handed out again.
    pub retire_ticks: u8,
    /// Slots spent broadcasting resets after start.
    pub reset_cycles: u32,
    /// Join responses go out at most once per this many slots.
    pub join_response_interval: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tx_packets: 100,
            rx_packets: 100,
            max_nodes: MAX_NODES,
            max_active_tx: 32,
            burst_size: 2,
            max_pending_joins: 10,
            node_ttl_ticks: 180,
            provisional_ttl_ticks: 100,
            retire_ticks: 30,
            reset_cycles: 4,
            join_response_interval: 4,
        }
    }
}

impl MasterConfig {
    fn validate(&self) -> Result<(), String> {
        if self.tx_packets == 0 {
            return Err("master.tx_packets must be > 0".into());
        }
        if self.rx_packets < 3 {
            return Err("master.rx_packets must be >= 3".into());
        }
        if self.max_nodes < 2 || self.max_nodes > MAX_NODES {
            return Err(format!("master.max_nodes must lie within [2, {MAX_NODES}]"));
        }
        if self.max_active_tx == 0 || self.burst_size == 0 || self.max_pending_joins == 0 {
            return Err("master.max_active_tx, burst_size and max_pending_joins must be > 0".into());
        }
        if self.node_ttl_ticks == 0 || self.provisional_ttl_ticks == 0 {
            return Err("master TTLs must be > 0".into());
        }
        if self.join_response_interval < 2 {
            return Err("master.join_response_interval must be >= 2".into());
        }
        Ok(())
    }
}

/// Node sizing and liveness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tx_packets: usize,
    pub rx_packets: usize,
    /// Liveness ticks without seeing our identity scheduled before rejoining.
    pub self_ttl_ticks: u8,
    /// Upper bound of the join retry window, in join slots.
    pub join_backoff_max: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tx_packets: 10,
            rx_packets: 10,
            self_ttl_ticks: 140,
            join_backoff_max: 8,
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<(), String> {
        if self.tx_packets == 0 {
            return Err("node.tx_packets must be > 0".into());
        }
        if self.rx_packets < 3 {
            return Err("node.rx_packets must be >= 3".into());
        }
        if self.self_ttl_ticks == 0 {
            return Err("node.self_ttl_ticks must be > 0".into());
        }
        Ok(())
    }
}

/// Slot allocation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Slots between join slots right after a join.
    pub unallocated_gap_min: u16,
    /// Slots between join slots once the network is quiet.
    pub unallocated_gap_max: u16,
    /// Join slots without a new node before the gap doubles.
    pub gap_backoff_rounds: u16,
    /// Longest a node may wait for a transmit opportunity.
    pub max_slots_per_node_tx_chance: u16,
    /// Slots a node must have gone unscheduled before it gets an ack slot.
    pub ack_service_interval: usize,
    /// A node not yet heard since admission gets one slot in this many.
    pub provisional_service_interval: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unallocated_gap_min: 2,
            unallocated_gap_max: 80,
            gap_backoff_rounds: 64,
            max_slots_per_node_tx_chance: 32,
            ack_service_interval: 8,
            provisional_service_interval: 4,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.unallocated_gap_min < 2 {
            return Err("scheduler.unallocated_gap_min must be >= 2".into());
        }
        if self.unallocated_gap_max < self.unallocated_gap_min {
            return Err("scheduler.unallocated_gap_max must be >= unallocated_gap_min".into());
        }
        if self.gap_backoff_rounds == 0 || self.max_slots_per_node_tx_chance == 0 {
            return Err("scheduler backoff rounds and latency bound must be > 0".into());
        }
        if self.ack_service_interval == 0 {
            return Err("scheduler.ack_service_interval must be > 0".into());
        }
        if self.provisional_service_interval < 2 {
            return Err("scheduler.provisional_service_interval must be >= 2".into());
        }
        Ok(())
    }
}
