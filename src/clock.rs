// Numan Thabit 2025
// clock.rs - microsecond accumulator driving coarse liveness ticks
use std::time::Duration;

use crate::wire::SLOT_TIME_US;

const MIN_TICK_US: u64 = SLOT_TIME_US as u64;
const MAX_TICK_US: u64 = 1_000_000; // 1 s

/// Turns hardware timer deltas into whole liveness ticks.
#[derive(Debug, Clone)]
pub struct TickClock {
    tick_us: u64,
    carry_us: u64,
}

impl TickClock {
    pub fn new(tick: Duration) -> Self {
        let tick_us = (tick.as_micros() as u64).clamp(MIN_TICK_US, MAX_TICK_US);
        Self {
            tick_us,
            carry_us: 0,
        }
    }

    /// Adds `micros` of elapsed time and returns how many ticks completed.
    pub fn advance(&mut self, micros: u32) -> u32 {
        self.carry_us += u64::from(micros);
        let fired = self.carry_us / self.tick_us;
        self.carry_us %= self.tick_us;
        fired as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_partial_ticks() {
        let mut clock = TickClock::new(Duration::from_micros(1000));
        assert_eq!(clock.advance(600), 0);
        assert_eq!(clock.advance(600), 1);
        assert_eq!(clock.advance(2800), 3);
        assert_eq!(clock.advance(199), 0);
        assert_eq!(clock.advance(1), 1);
    }

    #[test]
    fn clamps_tick_to_slot_time() {
        let mut clock = TickClock::new(Duration::from_micros(10));
        assert_eq!(clock.advance(SLOT_TIME_US as u32 - 1), 0);
        assert_eq!(clock.advance(1), 1);
    }
}
