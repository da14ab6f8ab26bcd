// Numan Thabit 2025
// metrics.rs - link counters and Prometheus export
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

use crate::wire::{PacketKind, WireError};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Per-endpoint counters, bumped from the slot pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub slots: u64,
    pub tx_packets: u64,
    pub tx_data_packets: u64,
    pub rx_packets: u64,
    pub rx_data_packets: u64,
    pub rx_empty: u64,
    pub rx_crc_failures: u64,
    pub rx_invalid_protocol: u64,
    pub rx_invalid_header: u64,
    pub rx_invalid_kind: u64,
    pub rx_unknown_source: u64,
    pub rx_out_of_order: u64,
    pub rx_buffer_full: u64,
    pub tx_window_restarts: u64,
    pub acked_packets: u64,
    pub join_requests: u64,
    pub joins_admitted: u64,
    pub network_full: u64,
    pub nodes_evicted: u64,
    pub rx_high_water: u64,
}

impl LinkStats {
    /// Counts a header that failed to decode.
    pub fn record_wire_error(&mut self, err: &WireError) {
        match err {
            WireError::Empty(_) => self.rx_empty += 1,
            WireError::VersionMismatch { .. } => self.rx_invalid_protocol += 1,
            WireError::Checksum { .. } | WireError::DataSize(_) => self.rx_invalid_header += 1,
            WireError::InvalidKind(_) | WireError::WrongRole { .. } => self.rx_invalid_kind += 1,
        }
    }

    pub(crate) fn record_tx(&mut self, kind: PacketKind) {
        self.tx_packets += 1;
        if kind.is_data() {
            self.tx_data_packets += 1;
        }
    }

    /// Packets the receive path threw away for any reason.
    pub fn rx_dropped(&self) -> u64 {
        self.rx_empty
            + self.rx_crc_failures
            + self.rx_invalid_protocol
            + self.rx_invalid_header
            + self.rx_invalid_kind
            + self.rx_unknown_source
            + self.rx_out_of_order
            + self.rx_buffer_full
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub slots: IntCounter,
    pub tx_packets: IntCounter,
    pub tx_data_packets: IntCounter,
    pub rx_packets: IntCounter,
    pub rx_data_packets: IntCounter,
    pub rx_empty: IntCounter,
    pub rx_crc_failures: IntCounter,
    pub rx_invalid_protocol: IntCounter,
    pub rx_invalid_header: IntCounter,
    pub rx_invalid_kind: IntCounter,
    pub rx_unknown_source: IntCounter,
    pub rx_out_of_order: IntCounter,
    pub rx_buffer_full: IntCounter,
    pub tx_window_restarts: IntCounter,
    pub acked_packets: IntCounter,
    pub join_requests: IntCounter,
    pub joins_admitted: IntCounter,
    pub network_full: IntCounter,
    pub nodes_evicted: IntCounter,
    pub rx_high_water: IntGauge,
    pub connected_nodes: IntGauge,
    pub rx_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("tdmabus".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let slots = register_counter!("slots_total", "Slots processed by the engine");
        let tx_packets = register_counter!("tx_packets_total", "Packets transmitted");
        let tx_data_packets =
            register_counter!("tx_data_packets_total", "Data packets transmitted");
        let rx_packets = register_counter!("rx_packets_total", "Valid packets received");
        let rx_data_packets =
            register_counter!("rx_data_packets_total", "Data packets received");
        let rx_empty = register_counter!("rx_empty_total", "Slots where nothing was on the bus");
        let rx_crc_failures =
            register_counter!("rx_crc_failures_total", "Receives flagged corrupt by the PHY");
        let rx_invalid_protocol = register_counter!(
            "rx_invalid_protocol_total",
            "Packets with a mismatched protocol version"
        );
        let rx_invalid_header = register_counter!(
            "rx_invalid_header_total",
            "Packets failing the header checksum or size check"
        );
        let rx_invalid_kind =
            register_counter!("rx_invalid_kind_total", "Packets of an unexpected kind");
        let rx_unknown_source = register_counter!(
            "rx_unknown_source_total",
            "Packets from a node that does not own the slot"
        );
        let rx_out_of_order =
            register_counter!("rx_out_of_order_total", "Data packets failing the sequence gate");
        let rx_buffer_full = register_counter!(
            "rx_buffer_full_total",
            "Data packets dropped for lack of receive buffers"
        );
        let tx_window_restarts =
            register_counter!("tx_window_restarts_total", "Send window rewinds");
        let acked_packets = register_counter!("acked_packets_total", "Packets released by acks");
        let join_requests = register_counter!("join_requests_total", "Join requests parsed");
        let joins_admitted = register_counter!("joins_admitted_total", "Node identities handed out");
        let network_full =
            register_counter!("network_full_total", "Join requests refused for lack of space");
        let nodes_evicted = register_counter!("nodes_evicted_total", "Nodes torn down on timeout");
        let rx_high_water =
            register_gauge!("rx_high_water", "Deepest the receive delivery queue has been");
        let connected_nodes = register_gauge!("connected_nodes", "Nodes currently connected");
        let rx_queue_depth =
            register_gauge!("rx_queue_depth", "Packets waiting for the application");

        Ok(Self {
            registry,
            slots,
            tx_packets,
            tx_data_packets,
            rx_packets,
            rx_data_packets,
            rx_empty,
            rx_crc_failures,
            rx_invalid_protocol,
            rx_invalid_header,
            rx_invalid_kind,
            rx_unknown_source,
            rx_out_of_order,
            rx_buffer_full,
            tx_window_restarts,
            acked_packets,
            join_requests,
            joins_admitted,
            network_full,
            nodes_evicted,
            rx_high_water,
            connected_nodes,
            rx_queue_depth,
        })
    }

    /// Brings the exported counters up to the values in `stats`.
    pub fn record(&self, stats: &LinkStats) {
        fn catch_up(counter: &IntCounter, value: u64) {
            counter.inc_by(value.saturating_sub(counter.get()));
        }

        catch_up(&self.slots, stats.slots);
        catch_up(&self.tx_packets, stats.tx_packets);
        catch_up(&self.tx_data_packets, stats.tx_data_packets);
        catch_up(&self.rx_packets, stats.rx_packets);
        catch_up(&self.rx_data_packets, stats.rx_data_packets);
        catch_up(&self.rx_empty, stats.rx_empty);
        catch_up(&self.rx_crc_failures, stats.rx_crc_failures);
        catch_up(&self.rx_invalid_protocol, stats.rx_invalid_protocol);
        catch_up(&self.rx_invalid_header, stats.rx_invalid_header);
        catch_up(&self.rx_invalid_kind, stats.rx_invalid_kind);
        catch_up(&self.rx_unknown_source, stats.rx_unknown_source);
        catch_up(&self.rx_out_of_order, stats.rx_out_of_order);
        catch_up(&self.rx_buffer_full, stats.rx_buffer_full);
        catch_up(&self.tx_window_restarts, stats.tx_window_restarts);
        catch_up(&self.acked_packets, stats.acked_packets);
        catch_up(&self.join_requests, stats.join_requests);
        catch_up(&self.joins_admitted, stats.joins_admitted);
        catch_up(&self.network_full, stats.network_full);
        catch_up(&self.nodes_evicted, stats.nodes_evicted);
        self.rx_high_water
            .set(i64::try_from(stats.rx_high_water).unwrap_or(i64::MAX));
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
