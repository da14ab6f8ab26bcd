#![cfg(feature = "driver")]

//! Interrupt-style driver gluing a [`SlotEngine`] to a [`Phy`].
//!
//! The hardware reports each finished transfer through
//! [`BusDriver::on_transfer_complete`]. The driver runs the engine's fast
//! pre-process, starts the next transfer between framing edges, then runs the
//! slower post-process while that transfer is in flight.

use thiserror::Error;
use tracing::warn;

use crate::{
    api::{BusEndpoint, Phy, SlotBuffers, SlotEngine},
    metrics::{LinkStats, Metrics},
};

/// Configuration parameters controlling how the driver reacts to the transport.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Number of consecutive transfer errors tolerated before the driver halts.
    pub max_error_burst: usize,
    /// Whether to pulse the framing line around every transfer start.
    pub framing_pulse: bool,
}

impl DriverConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum tolerated burst of consecutive transfer errors.
    pub fn with_max_error_burst(mut self, burst: usize) -> Self {
        self.max_error_burst = burst;
        self
    }

    /// Enables or disables the framing pulse.
    pub fn with_framing_pulse(mut self, enabled: bool) -> Self {
        self.framing_pulse = enabled;
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_error_burst: 4,
            framing_pulse: true,
        }
    }
}

/// Error surfaced by [`BusDriver`].
#[derive(Debug, Error)]
pub enum DriverError<E: std::error::Error + 'static> {
    /// The transport failed too many times in a row.
    #[error("{consecutive_errors} consecutive transfer failures")]
    ErrorBurst {
        /// Number of back-to-back failures.
        consecutive_errors: usize,
        /// Last failure reported by the transport.
        #[source]
        last: E,
    },
    /// The driver halted after an error burst and has not been reset.
    #[error("driver halted after repeated transfer failures")]
    Halted,
}

/// Runs one endpoint's slot pipeline against a physical transport.
#[derive(Debug)]
pub struct BusDriver<E, P> {
    engine: E,
    phy: P,
    config: DriverConfig,
    consecutive_errors: usize,
    halted: bool,
}

impl<E, P> BusDriver<E, P>
where
    E: SlotEngine + BusEndpoint,
    P: Phy,
{
    pub fn new(engine: E, phy: P) -> Self {
        Self::with_config(engine, phy, DriverConfig::default())
    }

    pub fn with_config(engine: E, phy: P, config: DriverConfig) -> Self {
        Self {
            engine,
            phy,
            config,
            consecutive_errors: 0,
            halted: false,
        }
    }

    /// Starts the first transfer. Nothing has been received yet, so the
    /// engine sees an undamaged idle buffer.
    pub fn start(&mut self) -> Result<(), DriverError<P::Error>> {
        self.on_transfer_complete(false)
    }

    /// Transfer-complete handler. `corrupted` is the transport's verdict on the finished slot.
    pub fn on_transfer_complete(&mut self, corrupted: bool) -> Result<(), DriverError<P::Error>> {
        if self.halted {
            return Err(DriverError::Halted);
        }
        self.engine.pre_process(corrupted);

        if self.config.framing_pulse {
            self.phy.set_framing_signal(true);
        }
        let SlotBuffers { tx, rx } = self.engine.slot_buffers();
        let result = self.phy.start_transfer(tx, rx);
        if self.config.framing_pulse {
            self.phy.set_framing_signal(false);
        }

        self.engine.post_process();

        match result {
            Ok(()) => {
                self.consecutive_errors = 0;
                Ok(())
            }
            Err(err) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > self.config.max_error_burst {
                    self.halted = true;
                    return Err(DriverError::ErrorBurst {
                        consecutive_errors: self.consecutive_errors,
                        last: err,
                    });
                }
                warn!(
                    error = %err,
                    consecutive = self.consecutive_errors,
                    "transfer failed to start"
                );
                Ok(())
            }
        }
    }

    /// Hardware timer handler.
    pub fn on_timer(&mut self, micros: u32) {
        self.engine.advance_time(micros);
    }

    /// Clears a halt so transfers may resume.
    pub fn reset_errors(&mut self) {
        self.consecutive_errors = 0;
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> &LinkStats {
        self.engine.stats()
    }

    /// Pushes the engine's counters into `metrics`.
    pub fn publish(&self, metrics: &Metrics) {
        metrics.record(self.engine.stats());
        metrics
            .connected_nodes
            .set(self.engine.connected_nodes_bitmap().count_ones() as i64);
        metrics.rx_queue_depth.set(self.engine.pending_rx() as i64);
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn into_parts(self) -> (E, P) {
        (self.engine, self.phy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, master::MasterEngine, wire::Packet};

    #[derive(Debug, Error)]
    #[error("mock transfer failure")]
    struct MockError;

    #[derive(Debug, Default)]
    struct MockPhy {
        framing: Vec<bool>,
        transfers: usize,
        tx_frames: usize,
        fail_next: usize,
    }

    impl Phy for MockPhy {
        type Error = MockError;

        fn set_framing_signal(&mut self, high: bool) {
            self.framing.push(high);
        }

        fn start_transfer(&mut self, tx: Option<&Packet>, rx: &mut Packet) -> Result<(), MockError> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(MockError);
            }
            self.transfers += 1;
            if tx.is_some() {
                self.tx_frames += 1;
            }
            *rx = Packet::idle();
            Ok(())
        }
    }

    fn driver(config: DriverConfig) -> BusDriver<MasterEngine, MockPhy> {
        BusDriver::with_config(
            MasterEngine::new(&Config::default()),
            MockPhy::default(),
            config,
        )
    }

    #[test]
    fn frames_every_transfer() {
        let mut driver = driver(DriverConfig::new());
        driver.start().unwrap();
        for _ in 0..9 {
            driver.on_timer(200);
            driver.on_transfer_complete(false).unwrap();
        }
        let phy = driver.phy();
        assert_eq!(phy.transfers, 10);
        assert_eq!(phy.tx_frames, 10);
        assert_eq!(phy.framing.len(), 20);
        assert!(phy.framing.chunks(2).all(|edge| edge == [true, false]));
        assert_eq!(driver.stats().slots, 10);
        assert_eq!(driver.stats().tx_packets, 10);
    }

    #[test]
    fn framing_pulse_can_be_disabled() {
        let mut driver = driver(DriverConfig::new().with_framing_pulse(false));
        driver.start().unwrap();
        assert!(driver.phy().framing.is_empty());
    }

    #[test]
    fn halts_after_error_burst() {
        let mut driver = driver(DriverConfig::new().with_max_error_burst(2));
        driver.phy_mut().fail_next = 10;
        driver.start().unwrap();
        driver.on_transfer_complete(true).unwrap();
        let err = driver.on_transfer_complete(true).unwrap_err();
        assert!(matches!(
            err,
            DriverError::ErrorBurst {
                consecutive_errors: 3,
                ..
            }
        ));
        assert!(driver.is_halted());
        assert!(matches!(
            driver.on_transfer_complete(false),
            Err(DriverError::Halted)
        ));

        driver.reset_errors();
        driver.phy_mut().fail_next = 0;
        driver.on_transfer_complete(false).unwrap();
        assert_eq!(driver.phy().transfers, 1);
    }

    #[test]
    fn publishes_engine_counters() {
        let metrics = Metrics::new().unwrap();
        let mut driver = driver(DriverConfig::new());
        driver.start().unwrap();
        driver.on_transfer_complete(false).unwrap();
        driver.publish(&metrics);
        assert_eq!(metrics.slots.get(), 2);
        assert_eq!(metrics.connected_nodes.get(), 1);
        assert_eq!(metrics.rx_queue_depth.get(), 0);
    }
}
